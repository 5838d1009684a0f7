//! JSON-over-HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{RemoteOperation, Transport, TransportError};
use crate::schema::Schema;

/// Maps remote operations onto REST routes under a base URL.
///
/// | operation           | route                          |
/// |---------------------|--------------------------------|
/// | `Fetch`             | `GET /{path}?attr=value&limit=n` |
/// | `Fetch` of one id   | `GET /{path}/{id}`             |
/// | `FetchRelationship` | `GET /{path}/{id}/{relationship}` |
/// | `Insert`            | `POST /{path}`                 |
/// | `Update`            | `PUT /{path}/{id}`             |
/// | `Delete`            | `DELETE /{path}/{id}`          |
#[derive(Clone)]
pub struct RestTransport {
  client: Client,
  base: Url,
  schema: Arc<Schema>,
  token: Option<String>,
}

impl RestTransport {
  pub fn new(base: Url, schema: Arc<Schema>, timeout: Duration) -> Result<Self, TransportError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::network(e.to_string()))?;

    Ok(Self {
      client,
      base,
      schema,
      token: None,
    })
  }

  pub fn with_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  fn url(&self, entity: &str, tail: &[&str]) -> Result<Url, TransportError> {
    let description = self
      .schema
      .entity(entity)
      .map_err(|e| TransportError::rejected(e.to_string()))?;
    let path = description.resource_path();

    let mut url = self.base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| TransportError::network(format!("{} cannot be a base URL", self.base)))?;
      segments.pop_if_empty();
      segments.extend(path.split('/').filter(|s| !s.is_empty()));
      segments.extend(tail);
    }
    Ok(url)
  }

  fn build(&self, operation: &RemoteOperation) -> Result<RequestBuilder, TransportError> {
    let request = match operation {
      RemoteOperation::Fetch { request } => {
        if let Some(id) = request.predicate.single_identifier() {
          let url = self.url(&request.entity, &[id.as_str()])?;
          return Ok(self.authorized(self.client.request(Method::GET, url)));
        }

        let mut url = self.url(&request.entity, &[])?;
        {
          let mut query = url.query_pairs_mut();
          for (attribute, value) in request.predicate.equalities() {
            query.append_pair(attribute, &query_value(value));
          }
          if let Some(limit) = request.limit {
            query.append_pair("limit", &limit.to_string());
          }
        }
        // Drop the dangling `?` when nothing was appended
        if url.query() == Some("") {
          url.set_query(None);
        }
        self.client.request(Method::GET, url)
      }
      RemoteOperation::FetchRelationship {
        entity,
        resource_identifier,
        relationship,
      } => {
        let url = self.url(entity, &[resource_identifier.as_str(), relationship])?;
        self.client.request(Method::GET, url)
      }
      RemoteOperation::Insert { entity, payload } => {
        let url = self.url(entity, &[])?;
        self.client.request(Method::POST, url).json(payload)
      }
      RemoteOperation::Update {
        entity,
        resource_identifier,
        payload,
      } => {
        let url = self.url(entity, &[resource_identifier.as_str()])?;
        self.client.request(Method::PUT, url).json(payload)
      }
      RemoteOperation::Delete {
        entity,
        resource_identifier,
      } => {
        let url = self.url(entity, &[resource_identifier.as_str()])?;
        self.client.request(Method::DELETE, url)
      }
    };

    Ok(self.authorized(request))
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }
}

fn query_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn request_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::timeout(e.to_string())
  } else {
    TransportError::network(e.to_string())
  }
}

#[async_trait]
impl Transport for RestTransport {
  async fn request(&self, operation: &RemoteOperation) -> Result<Value, TransportError> {
    let request = self.build(operation)?;
    debug!(%operation, "sending request");

    let response = request.send().await.map_err(request_error)?;
    let status = response.status();
    let body = response.bytes().await.map_err(request_error)?;

    if !status.is_success() {
      let text = String::from_utf8_lossy(&body);
      return Err(TransportError::rejected(format!("{}: {}", status, text.trim())));
    }
    if body.iter().all(u8::is_ascii_whitespace) {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|e| TransportError::parse(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::{FetchRequest, Predicate};
  use crate::schema::EntityDescription;
  use serde_json::json;

  fn transport(base: &str) -> RestTransport {
    let schema = Schema::new()
      .with_entity(EntityDescription::new("user"))
      .with_entity(EntityDescription::new("person").at_path("/api/people/"));
    RestTransport::new(
      Url::parse(base).unwrap(),
      Arc::new(schema),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  #[test]
  fn test_urls_follow_entity_paths() {
    let t = transport("http://example.test/v1/");
    assert_eq!(
      t.url("user", &["7"]).unwrap().as_str(),
      "http://example.test/v1/users/7"
    );
    assert_eq!(
      t.url("person", &["a b", "friends"]).unwrap().as_str(),
      "http://example.test/v1/api/people/a%20b/friends"
    );
    assert!(t.url("ghost", &[]).is_err());
  }

  #[test]
  fn test_fetch_encodes_equalities_and_limit() {
    let t = transport("http://example.test");
    let request = FetchRequest::new("user")
      .filter(Predicate::eq("team", "core").and(Predicate::eq("age", 30)))
      .limit(2);
    let built = t
      .build(&RemoteOperation::Fetch { request })
      .unwrap()
      .build()
      .unwrap();
    assert_eq!(
      built.url().as_str(),
      "http://example.test/users?team=core&age=30&limit=2"
    );

    let plain = t
      .build(&RemoteOperation::Fetch {
        request: FetchRequest::new("user"),
      })
      .unwrap()
      .build()
      .unwrap();
    assert_eq!(plain.url().as_str(), "http://example.test/users");
  }

  #[test]
  fn test_fetch_of_one_identifier_targets_the_item_route() {
    let t = transport("http://example.test").with_token("secret");
    let request = FetchRequest::new("person").filter(Predicate::IdentifierIn(vec!["7".into()]));
    let built = t
      .build(&RemoteOperation::Fetch { request })
      .unwrap()
      .build()
      .unwrap();
    assert_eq!(built.method(), Method::GET);
    assert_eq!(built.url().as_str(), "http://example.test/api/people/7");
    assert!(built.headers().contains_key("authorization"));
  }

  #[test]
  fn test_bearer_token_is_attached() {
    let t = transport("http://example.test").with_token("secret");
    let built = t
      .build(&RemoteOperation::Insert {
        entity: "user".into(),
        payload: json!({"name": "Ann"}),
      })
      .unwrap()
      .build()
      .unwrap();
    assert_eq!(built.method(), Method::POST);
    assert_eq!(
      built.headers()["authorization"].to_str().unwrap(),
      "Bearer secret"
    );
  }
}
