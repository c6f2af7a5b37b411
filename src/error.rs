use serde::Serialize;
use thiserror::Error;

/// Classified failures of one intake request.
///
/// Every phase returns one of these; only the orchestrator turns them into
/// a response.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unexpected fault: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Decode,
    Inference,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Decode => "decode",
            ErrorKind::Inference => "inference",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl IntakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntakeError::Input(_) => ErrorKind::Input,
            IntakeError::Decode(_) => ErrorKind::Decode,
            IntakeError::Inference(_) => ErrorKind::Inference,
            IntakeError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// The bare message, without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            IntakeError::Input(m)
            | IntakeError::Decode(m)
            | IntakeError::Inference(m)
            | IntakeError::Unexpected(m) => m,
        }
    }

    pub fn input(msg: impl Into<String>) -> Self {
        IntakeError::Input(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        IntakeError::Decode(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message() {
        let err = IntakeError::input("empty file");
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(err.message(), "empty file");
        assert_eq!(err.to_string(), "invalid input: empty file");

        let err = IntakeError::decode("not an image");
        assert_eq!(err.kind().as_str(), "decode");
    }
}
