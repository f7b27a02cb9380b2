use std::time::Duration;

/// Failure of an API call.
///
/// `Clone` because a coalesced failure is handed to every caller that joined
/// the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("network error: {0}")]
  Network(String),

  /// 401 from the server. `token_present` records whether a credential was
  /// attached when the request was sent.
  #[error("authentication required")]
  Unauthenticated { token_present: bool },

  #[error("request rejected ({status}): {message}")]
  Client { status: u16, message: String },

  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },

  #[error("unexpected response body: {0}")]
  Decode(String),
}

/// Error taxonomy used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// Timeout or connection failure; the next scheduled tick retries.
  TransientNetwork,
  /// 4xx other than 401, or a body the client could not understand.
  ClientError,
  /// 401 while holding a token: the session is gone.
  AuthInvalid,
  /// 401 without a token: the endpoint simply needs auth.
  AuthIrrelevant,
  /// 5xx.
  ServerError,
}

impl ApiError {
  pub fn class(&self) -> ErrorClass {
    match self {
      ApiError::Timeout(_) | ApiError::Network(_) => ErrorClass::TransientNetwork,
      ApiError::Unauthenticated {
        token_present: true,
      } => ErrorClass::AuthInvalid,
      ApiError::Unauthenticated {
        token_present: false,
      } => ErrorClass::AuthIrrelevant,
      ApiError::Client { .. } | ApiError::Decode(_) => ErrorClass::ClientError,
      ApiError::Server { .. } => ErrorClass::ServerError,
    }
  }

  /// Build the error for a non-success HTTP status.
  pub fn from_status(status: u16, body: &[u8], token_present: bool) -> Self {
    if status == 401 {
      return ApiError::Unauthenticated { token_present };
    }
    let message = error_message(body);
    if status >= 500 {
      ApiError::Server { status, message }
    } else {
      ApiError::Client { status, message }
    }
  }
}

/// Pull a human readable message out of an error body.
///
/// Marketplace endpoints answer `{"message": "..."}` or `{"error": "..."}`;
/// anything else is passed through as text.
fn error_message(body: &[u8]) -> String {
  if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
    for field in ["message", "error"] {
      if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
        return text.to_string();
      }
    }
  }
  String::from_utf8_lossy(body).trim().to_string()
}
