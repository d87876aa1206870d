use thiserror::Error;

/// Coarse classification of a [`ClientError`], for callers that branch on
/// the failure class rather than the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Remote,
    NotConnected,
    InvalidInput,
}

/// Canonical error type of the client boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Transport failure or timeout. The only retryable class.
    #[error("network error: {0}")]
    Network(String),

    /// The ledger program rejected the query or the transaction. The reason
    /// is kept verbatim so it can be shown to the user as-is.
    #[error("{0}")]
    Remote(String),

    /// A write was attempted without a signing capability.
    #[error("wallet not connected")]
    NotConnected,

    /// Malformed caller input (non-positive amount, bad address, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Network(_) => ErrorKind::Network,
            ClientError::Remote(_) => ErrorKind::Remote,
            ClientError::NotConnected => ErrorKind::NotConnected,
            ClientError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }

    pub(crate) fn malformed(query: &str, detail: impl std::fmt::Display) -> Self {
        ClientError::Remote(format!("malformed {query} response: {detail}"))
    }
}
