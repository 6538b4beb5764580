//! Job messages as they arrive on the queue.
//!
//! The producer publishes a JSON object with `job_id` and `image_url`.
//! [`JobMessage::decode`] turns a raw delivery payload into that shape and
//! never touches the network or the clock.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unit of work: detect objects in the image at `image_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    pub image_url: String,
}

/// The payload could not be read as a [`JobMessage`].
#[derive(Debug, Error)]
#[error("malformed job payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl JobMessage {
    /// Parses a delivery payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serializes the message the way the producer does.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
