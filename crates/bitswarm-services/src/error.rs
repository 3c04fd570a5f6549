use bitswarm_core::wire::WireError;

/// Failure kinds surfaced by the exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// The peer sent an unexpected token or payload.
    #[error("protocol issue: {0}")]
    ProtocolIssue(String),
    #[error("connection issue: {0}")]
    ConnectionIssue(String),
    #[error("timed out: {0}")]
    TimeoutIssue(String),
    #[error("block store: {0}")]
    Store(#[from] anyhow::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl ExchangeError {
    /// Connection and timeout failures count against a peer's standing.
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, Self::ConnectionIssue(_) | Self::TimeoutIssue(_))
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::TimeoutIssue(e.to_string()),
            _ => Self::ConnectionIssue(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
