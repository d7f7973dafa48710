use thiserror::Error;

/// Failure of a single device poll. Always recovered inside the sweep as a
/// failure sample; never escapes the per-device boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out waiting for prompt {marker:?}")]
    ProtocolTimeout { marker: String },
    #[error("shell channel error: {0}")]
    Channel(String),
}

pub type PollResult<T> = Result<T, PollError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_marker() {
        let err = PollError::ProtocolTimeout {
            marker: "RScmCli#".to_string(),
        };
        assert!(err.to_string().contains("RScmCli#"));
    }
}
