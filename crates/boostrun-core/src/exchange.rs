//! Prediction request payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One prediction request: input channel name → ordered feature values.
///
/// Serializes as a plain JSON object, e.g. `{"bar":[0.3],"foo":[1.0,2.0]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeRequest(BTreeMap<String, Vec<f32>>);

impl ExchangeRequest {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the features of one channel.
    pub fn with_channel(mut self, name: impl Into<String>, features: Vec<f32>) -> Self {
        self.0.insert(name.into(), features);
        self
    }

    /// Features for a channel, if present.
    pub fn channel(&self, name: &str) -> Option<&[f32]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Number of channels in the request.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the request has no channels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, Vec<f32>>> for ExchangeRequest {
    fn from(map: BTreeMap<String, Vec<f32>>) -> Self {
        Self(map)
    }
}
