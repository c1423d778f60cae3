//! Engines backed by real speech and language services.

mod http;
mod process;

pub use http::{HttpGeneration, HttpGenerationConfig};
pub use process::{ProcessRecognition, ProcessSynthesis};
