use thiserror::Error;

/// Failure of a single call against a boundary collaborator (store, event log,
/// authoritative API).
///
/// The reconciliation boundary maps every variant to skip-and-log for the
/// affected toolchain id; only the scheduler treats them as fatal, and only when
/// they escape a whole-tick query such as the incremental event scan.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("revision conflict writing document {0}")]
    Conflict(String),
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("invalid view query: {0}")]
    InvalidQuery(String),
}

impl AccessError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Short, stable label used in reports and audit lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Malformed(_) => "malformed",
            Self::InvalidQuery(_) => "invalid-query",
        }
    }
}

impl From<serde_json::Error> for AccessError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for AccessError {
    fn from(err: reqwest::Error) -> Self {
        // Strip the URL: store URLs may carry credentials.
        Self::Transient(err.without_url().to_string())
    }
}
