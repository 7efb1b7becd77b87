//! HTTP backend speaking the PostgREST row-insert dialect.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{RemoteService, ServiceError, ServiceErrorKind};

/// Remote data service over HTTP.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
}

// Manual impl: the client's default headers carry the API key.
impl std::fmt::Debug for HttpRemote {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpRemote").field("base_url", &self.base_url).finish_non_exhaustive()
  }
}

impl HttpRemote {
  /// Create a client for `base_url` authenticated with `api_key`.
  ///
  /// `timeout` bounds every request.
  pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ServiceError> {
    let base_url = Url::parse(base_url)
      .map_err(|e| ServiceError::new(ServiceErrorKind::Config, format!("Invalid backend URL {}: {}", base_url, e)))?;

    let mut headers = HeaderMap::new();
    let key = HeaderValue::from_str(api_key)
      .map_err(|e| ServiceError::new(ServiceErrorKind::Config, format!("Invalid API key: {}", e)))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| ServiceError::new(ServiceErrorKind::Config, format!("Invalid API key: {}", e)))?;
    headers.insert("apikey", key);
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()
      .map_err(|e| ServiceError::network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  fn table_url(&self, resource_type: &str) -> Result<Url, ServiceError> {
    self
      .base_url
      .join(&format!("rest/v1/{}", resource_type))
      .map_err(|e| ServiceError::new(ServiceErrorKind::Config, format!("Invalid resource {}: {}", resource_type, e)))
  }

  /// Check that the backend answers at all. Any HTTP response counts.
  pub async fn probe(&self) -> Result<(), ServiceError> {
    self
      .client
      .head(self.base_url.clone())
      .send()
      .await
      .map(|_| ())
      .map_err(transport_error)
  }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
  if err.is_timeout() {
    ServiceError::timeout(err.to_string())
  } else if let Some(status) = err.status() {
    ServiceError::from_status(status.as_u16(), err.to_string())
  } else {
    ServiceError::network(err.to_string())
  }
}

impl RemoteService for HttpRemote {
  async fn create(&self, resource_type: &str, payload: &Value) -> Result<Value, ServiceError> {
    let url = self.table_url(resource_type)?;

    let response = self
      .client
      .post(url)
      .header("Prefer", "return=representation")
      .json(payload)
      .send()
      .await
      .map_err(transport_error)?;

    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
      return Err(ServiceError::from_status(status.as_u16(), body));
    }

    let rows: Value = serde_json::from_str(&body).map_err(|e| {
      ServiceError::new(ServiceErrorKind::InvalidResponse, format!("Failed to parse response: {}", e))
    })?;
    first_row(rows)
  }
}

/// The insert endpoint answers with an array of stored rows.
fn first_row(rows: Value) -> Result<Value, ServiceError> {
  match rows {
    Value::Array(rows) => rows
      .into_iter()
      .next()
      .ok_or_else(|| ServiceError::new(ServiceErrorKind::InvalidResponse, "Insert returned no rows")),
    row @ Value::Object(_) => Ok(row),
    other => Err(ServiceError::new(
      ServiceErrorKind::InvalidResponse,
      format!("Unexpected response: {}", other),
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::FailureClass;
  use serde_json::json;

  #[test]
  fn test_first_row_of_array() {
    let row = first_row(json!([{ "id": "srv-42" }, { "id": "srv-43" }])).unwrap();
    assert_eq!(row["id"], "srv-42");
  }

  #[test]
  fn test_first_row_rejects_empty() {
    let err = first_row(json!([])).unwrap_err();
    assert_eq!(err.kind, ServiceErrorKind::InvalidResponse);
  }

  #[test]
  fn test_table_url_joins_resource() {
    let remote = HttpRemote::new("https://example.test/", "anon", Duration::from_secs(5)).unwrap();
    assert_eq!(
      remote.table_url("habit_logs").unwrap().as_str(),
      "https://example.test/rest/v1/habit_logs"
    );
  }

  #[test]
  fn test_invalid_setup_is_a_config_error() {
    let err = HttpRemote::new("not a url", "anon", Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.kind, ServiceErrorKind::Config);
    assert_eq!(err.class(), FailureClass::Permanent);

    let err = HttpRemote::new("https://example.test/", "bad\nkey", Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.kind, ServiceErrorKind::Config);
    assert!(err.to_string().starts_with("configuration error: Invalid API key"));
  }
}
