//! Freshness policies and store configuration.
//!
//! Whether cached rows answer a fetch on their own is a decision the caller
//! makes. There is no default policy: a [`StoreConfig`] cannot be
//! built without naming one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CacheRow;
use crate::query::FetchRequest;

/// Decides whether local results satisfy a fetch without a remote call.
pub trait FreshnessPolicy: Send + Sync {
  /// `last_fetched` is when this exact request last completed remotely.
  fn is_sufficient(
    &self,
    request: &FetchRequest,
    local: &[CacheRow],
    last_fetched: Option<DateTime<Utc>>,
  ) -> bool;
}

/// Built-in policies, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Freshness {
  /// Never go remote
  LocalOnly,
  /// Go remote only when nothing is cached
  NonEmpty,
  /// Go remote when the request was never fetched or was fetched too long ago
  StaleAfter { seconds: u64 },
  /// Always go remote
  AlwaysRemote,
}

impl Freshness {
  pub fn stale_after(ttl: Duration) -> Self {
    Freshness::StaleAfter {
      seconds: ttl.as_secs(),
    }
  }
}

impl FreshnessPolicy for Freshness {
  fn is_sufficient(
    &self,
    _request: &FetchRequest,
    local: &[CacheRow],
    last_fetched: Option<DateTime<Utc>>,
  ) -> bool {
    match self {
      Freshness::LocalOnly => true,
      Freshness::NonEmpty => !local.is_empty(),
      Freshness::StaleAfter { seconds } => match last_fetched {
        Some(at) => {
          let age = Utc::now().signed_duration_since(at);
          age.num_seconds() < *seconds as i64
        }
        None => false,
      },
      Freshness::AlwaysRemote => false,
    }
  }
}

/// What an update sends to the remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePayload {
  /// Only the changed fields
  #[default]
  Delta,
  /// The cached row with the changes applied
  Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
  pub freshness: Freshness,
  /// Serve cached rows, flagged offline, when the remote call fails
  #[serde(default)]
  pub degrade_on_failure: bool,
  /// Upper bound on concurrent transport calls
  #[serde(default = "default_max_in_flight")]
  pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
  4
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveConfig {
  #[serde(default)]
  pub update_payload: UpdatePayload,
}

/// Store behaviour knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
  pub fetch: FetchConfig,
  #[serde(default)]
  pub save: SaveConfig,
}

impl StoreConfig {
  pub fn new(freshness: Freshness) -> Self {
    Self {
      fetch: FetchConfig {
        freshness,
        degrade_on_failure: false,
        max_in_flight: default_max_in_flight(),
      },
      save: SaveConfig::default(),
    }
  }

  pub fn degrade_on_failure(mut self, degrade: bool) -> Self {
    self.fetch.degrade_on_failure = degrade;
    self
  }

  pub fn max_in_flight(mut self, max: usize) -> Self {
    self.fetch.max_in_flight = max.max(1);
    self
  }

  pub fn update_payload(mut self, payload: UpdatePayload) -> Self {
    self.save.update_payload = payload;
    self
  }
}
