use thiserror::Error;

/// Failure taxonomy for core operations. Adapters map these onto
/// `{ok:false, error}` payloads; only `Store` should abort a request outright.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Claim arbitration lost: the handoff was already accepted (or never existed).
    #[error("already accepted")]
    AlreadyAccepted,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not authorized")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    /// Bot responder or another upstream call failed. Recovered locally with
    /// fallback text, never shown to the end user as a hard error.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("store unavailable: {0}")]
    Store(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Store(err.to_string())
    }
}

impl CoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }
}
