pub mod client;
pub mod error;
pub mod types;

pub use client::{Detect, DetectionClient};
pub use error::DetectionError;
pub use types::DetectionResult;
