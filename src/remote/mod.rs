//! Remote data service interface and failure classification.

mod http;

use serde_json::Value;
use thiserror::Error;

pub use http::HttpRemote;

/// What went wrong talking to the remote service.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
  /// Host unreachable, connection reset, DNS failure
  #[error("network error")]
  Network,
  /// The call exceeded its deadline
  #[error("timeout")]
  Timeout,
  /// 5xx, 408 or 429
  #[error("server error ({0})")]
  Server(u16),
  /// The payload was rejected (400, 422)
  #[error("validation error")]
  Validation,
  /// Duplicate or conflicting row (409)
  #[error("conflict")]
  Conflict,
  /// Credentials missing or expired (401, 403)
  #[error("unauthorized")]
  Unauthorized,
  /// Any other 4xx
  #[error("client error ({0})")]
  Client(u16),
  /// The response could not be understood
  #[error("invalid response")]
  InvalidResponse,
  /// The client was set up with an unusable URL or API key
  #[error("configuration error")]
  Config,
}

/// How the sweeper should react to a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
  /// Retry on a later sweep
  Transient,
  /// Roll back and notify the user
  Permanent,
  /// Leave queued for the auth flow to resolve
  Unauthorized,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ServiceError {
  pub kind: ServiceErrorKind,
  pub message: String,
}

impl ServiceError {
  pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ServiceErrorKind::Network, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ServiceErrorKind::Timeout, message)
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ServiceErrorKind::Validation, message)
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::new(ServiceErrorKind::Conflict, message)
  }

  /// Map an HTTP status code to an error.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let kind = match status {
      401 | 403 => ServiceErrorKind::Unauthorized,
      409 => ServiceErrorKind::Conflict,
      400 | 422 => ServiceErrorKind::Validation,
      408 | 429 | 500..=599 => ServiceErrorKind::Server(status),
      _ => ServiceErrorKind::Client(status),
    };
    Self::new(kind, message)
  }

  pub fn class(&self) -> FailureClass {
    match self.kind {
      ServiceErrorKind::Network | ServiceErrorKind::Timeout | ServiceErrorKind::Server(_) => {
        FailureClass::Transient
      }
      ServiceErrorKind::Unauthorized => FailureClass::Unauthorized,
      ServiceErrorKind::Validation
      | ServiceErrorKind::Conflict
      | ServiceErrorKind::Client(_)
      | ServiceErrorKind::InvalidResponse
      | ServiceErrorKind::Config => FailureClass::Permanent,
    }
  }

  pub fn is_transient(&self) -> bool {
    self.class() == FailureClass::Transient
  }
}

impl From<ServiceError> for crate::error::SyncError {
  fn from(err: ServiceError) -> Self {
    if err.is_transient() {
      Self::TransientService {
        message: err.to_string(),
      }
    } else {
      Self::PermanentService {
        message: err.to_string(),
      }
    }
  }
}

/// The backend, reached through a generic request/response surface.
#[allow(async_fn_in_trait)]
pub trait RemoteService {
  /// Insert one row into `resource_type` and return the stored row.
  async fn create(&self, resource_type: &str, payload: &Value) -> Result<Value, ServiceError>;
}

impl<R: RemoteService> RemoteService for std::sync::Arc<R> {
  async fn create(&self, resource_type: &str, payload: &Value) -> Result<Value, ServiceError> {
    (**self).create(resource_type, payload).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;

  #[test]
  fn test_status_classification() {
    let class = |status| ServiceError::from_status(status, "x").class();

    assert_eq!(class(500), FailureClass::Transient);
    assert_eq!(class(503), FailureClass::Transient);
    assert_eq!(class(429), FailureClass::Transient);
    assert_eq!(class(400), FailureClass::Permanent);
    assert_eq!(class(409), FailureClass::Permanent);
    assert_eq!(class(422), FailureClass::Permanent);
    assert_eq!(class(404), FailureClass::Permanent);
    assert_eq!(class(401), FailureClass::Unauthorized);
    assert_eq!(class(403), FailureClass::Unauthorized);
  }

  #[test]
  fn test_transport_errors_are_transient() {
    assert!(ServiceError::network("reset").is_transient());
    assert!(ServiceError::timeout("10s").is_transient());
    assert!(!ServiceError::validation("value < 0").is_transient());
  }

  #[test]
  fn test_maps_into_sync_error() {
    assert!(matches!(
      SyncError::from(ServiceError::timeout("slow")),
      SyncError::TransientService { .. }
    ));
    assert!(matches!(
      SyncError::from(ServiceError::conflict("dup")),
      SyncError::PermanentService { .. }
    ));
  }

  #[test]
  fn test_display_includes_status() {
    let err = ServiceError::from_status(502, "bad gateway");
    assert_eq!(err.to_string(), "server error (502): bad gateway");
  }
}
