use thiserror::Error;

/// Transport-level failures talking to the mailerlite API. Retriable kinds
/// are already retried inside the client; what surfaces here is terminal
/// for the current attempt.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[source] reqwest_middleware::Error),
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest_middleware::Error),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("not found")]
    NotFound,
    #[error("request rejected as invalid: {body}")]
    Validation { body: String },
    #[error("authentication rejected with status {status}")]
    Auth { status: u16 },
    #[error("server error {status} after {attempts} attempts: {body}")]
    Server {
        status: u16,
        attempts: u32,
        body: String,
    },
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    /// Category recorded in `sync_log.error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Network(_) => "network",
            ClientError::Timeout(_) => "timeout",
            ClientError::RateLimited { .. } => "rate_limited",
            ClientError::NotFound => "not_found",
            ClientError::Validation { .. } => "validation",
            ClientError::Auth { .. } => "auth",
            ClientError::Server { .. } => "server",
            ClientError::UnexpectedStatus { .. } => "server",
            ClientError::Decode(_) => "validation",
            ClientError::Url(_) => "validation",
        }
    }

    pub fn status_code(&self) -> Option<i32> {
        match self {
            ClientError::Auth { status }
            | ClientError::Server { status, .. }
            | ClientError::UnexpectedStatus { status, .. } => Some(*status as i32),
            ClientError::RateLimited { .. } => Some(429),
            ClientError::NotFound => Some(404),
            _ => None,
        }
    }

    /// Auth failures abort the whole invocation instead of being counted
    /// as a per-record error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Auth { .. })
    }
}

/// Failures of a single record reconciliation. Per-field write failures do
/// not surface here; they become `error`-result log rows and the record
/// retries on the next run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("mailerlite error: {0}")]
    Client(#[from] ClientError),
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("invalid email {email:?}")]
    InvalidEmail { email: String },
    #[error("conflict {id} is not pending")]
    ConflictNotPending { id: i64 },
    #[error("conflict {id} not found")]
    ConflictNotFound { id: i64 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Client(err) if err.is_fatal())
    }
}
