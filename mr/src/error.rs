use serde::{Deserialize, Serialize};

/// Every failure the core can report.
///
/// The enum travels over RPC unchanged, so a task error raised on a worker
/// reaches the polling client with its kind intact. Payloads are rendered
/// messages rather than source errors for the same reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("no registered worker nodes found")]
    NoWorkers,
    #[error("operation {0} not found")]
    OperationNotFound(String),
    #[error("processor {0} not found")]
    UnknownProcessor(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("malformed record: {0}")]
    Codec(String),
    #[error("processing error: {0}")]
    Processing(String),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn processing(err: anyhow::Error) -> Self {
        Error::Processing(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Error::Io(err.to_string())
        } else {
            Error::Codec(err.to_string())
        }
    }
}

impl From<tarpc::client::RpcError> for Error {
    fn from(err: tarpc::client::RpcError) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_keeps_context_chain() {
        let err = anyhow::anyhow!("not a number").context("parsing line 3");
        assert_eq!(
            Error::processing(err),
            Error::Processing("parsing line 3: not a number".to_string())
        );
    }

    #[test]
    fn test_error_survives_json_round_trip() {
        let err = Error::UnknownProcessor("wc".to_string());
        let wire = serde_json::to_string(&err).unwrap();
        let back: Error = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.to_string(), "processor wc not found");
    }
}
