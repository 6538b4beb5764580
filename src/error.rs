use thiserror::Error;

use crate::amqp::AmqpError;
use crate::config::ConfigError;
use crate::detection::DetectionError;
use crate::job::DecodeError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Amqp(#[from] AmqpError),

    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Classifies a job failure for acknowledgement decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// The job payload itself is malformed; redelivery can never help.
    Decode,
    /// Likely to succeed on retry (network trouble, image not yet available).
    Transient,
    /// The detection service understood the request and refused it.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Decode => write!(f, "Decode"),
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Permanent => write!(f, "Permanent"),
        }
    }
}

impl DecodeError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Decode
    }
}
