//! Response shapes returned by the detection service.
//!
//! Only `predictions` is required. Each prediction is kept as the raw JSON
//! object the service sent, so model-specific fields pass through untouched
//! and in their original order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Successful response body of a detection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Detections in the order the service returned them.
    pub predictions: Vec<Prediction>,
    /// Server-side inference time in seconds, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Dimensions of the image as the model saw it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: f64,
    pub height: f64,
}

/// A single detection, opaque apart from a couple of read-only helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prediction(pub Map<String, Value>);

impl Prediction {
    /// Class label, if the model reports one under `class`.
    pub fn class(&self) -> Option<&str> {
        self.0.get("class").and_then(Value::as_str)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.0.get("confidence").and_then(Value::as_f64)
    }
}

impl DetectionResult {
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}
