use thiserror::Error;

/// Errors returned by the charger client.
///
/// `MissingField` and `InvalidField` are the per-property read failures: the
/// payload either lacks the key or carries a value of the wrong shape.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Timed out talking to {host}")]
    Timeout { host: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field '{0}'")]
    MissingField(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("'{0}' is not supported by this firmware")]
    UnsupportedFeature(String),

    #[error("Charger did not report a serial number")]
    MissingSerial,

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Websocket error: {0}")]
    Websocket(String),

    #[error("Invalid websocket URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The client was closed and makes no further requests.
    #[error("Client is closed")]
    Closed,
}

impl ClientError {
    /// True when the charger (or the network) did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Conditions of the client itself rather than the charger. They resolve
    /// on the next poll (or with the next client) without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Websocket(_) | ClientError::Closed)
    }

    /// A single property could not be read from an otherwise valid payload.
    pub fn is_read_suppressible(&self) -> bool {
        matches!(
            self,
            ClientError::MissingField(_) | ClientError::InvalidField { .. }
        )
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ClientError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            let host = e
                .url()
                .and_then(|u| u.host_str())
                .unwrap_or("unknown")
                .to_string();
            ClientError::Timeout { host }
        } else {
            ClientError::Http(e)
        }
    }
}
