use thiserror::Error;

use super::BackendStatus;

/// Errors that arise while talking to a single backend connection.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend '{id}' is not connected (state: {status:?})")]
    NotConnected { id: String, status: BackendStatus },

    #[error("backend '{id}' request timeout after {timeout_secs}s")]
    Timeout { id: String, timeout_secs: u64 },

    #[error("backend '{id}' transport closed")]
    TransportClosed { id: String },

    #[error("backend '{id}' handshake failed after {attempts} attempt(s): {source}")]
    HandshakeFailed {
        id: String,
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_message_carries_id_and_state() {
        let err = BackendError::NotConnected {
            id: "fs".to_string(),
            status: BackendStatus::Disconnected,
        };
        let msg = err.to_string();
        assert!(msg.contains("fs"));
        assert!(msg.contains("Disconnected"));
    }

    /// Scenario S4: the client-visible `InternalError` text must contain
    /// "timeout" so callers can detect this case by substring match.
    #[test]
    fn timeout_message_contains_seconds_and_the_word_timeout() {
        let err = BackendError::Timeout {
            id: "slow".to_string(),
            timeout_secs: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("1s"));
        assert!(msg.contains("timeout"));
    }
}
