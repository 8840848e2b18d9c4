//! Typed conversion of user values to and from opaque payloads.
//!
//! Everything that crosses the history boundary (inputs, results, signal
//! data, side-effect values) is carried as a [`Payload`]. The [`Converter`]
//! contract must be deterministic and round-trip lossless; [`JsonConverter`]
//! is the default used throughout the crate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque serialized value stored in history events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// Wrap an already-encoded value.
    pub fn from_json(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    /// The encoding of the unit value; used for completions that carry no
    /// data, e.g. a fired timer.
    pub fn null() -> Self {
        Self("null".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("encoding value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decoding payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode and decode user values; type hints come from the registered
/// workflow or activity function signature at the call site.
pub trait Converter {
    fn to_payload<T: Serialize>(&self, value: &T) -> Result<Payload, ConversionError>;
    fn from_payload<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, ConversionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn to_payload<T: Serialize>(&self, value: &T) -> Result<Payload, ConversionError> {
        serde_json::to_string(value)
            .map(Payload)
            .map_err(ConversionError::Encode)
    }

    fn from_payload<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, ConversionError> {
        serde_json::from_str(payload.as_str()).map_err(ConversionError::Decode)
    }
}
