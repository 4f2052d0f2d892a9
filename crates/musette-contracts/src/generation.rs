use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Upstream vendor whose request/response shape must be matched exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Meta,
    Stability,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Anthropic => f.write_str("anthropic"),
            Provider::Meta => f.write_str("meta"),
            Provider::Stability => f.write_str("stability"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    TextAndVision,
    Image,
}

impl Modality {
    /// Override keys that make sense for this modality; anything else is
    /// rejected before a payload is assembled.
    pub fn allowed_keys(self) -> &'static [&'static str] {
        match self {
            Modality::Text | Modality::TextAndVision => {
                &["temperature", "top_p", "top_k", "max_tokens", "max_gen_len"]
            }
            Modality::Image => &["cfg_scale", "steps", "seed"],
        }
    }

    pub fn accepts_key(self, key: &str) -> bool {
        self.allowed_keys().iter().any(|item| *item == key)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Text => f.write_str("text"),
            Modality::TextAndVision => f.write_str("text_and_vision"),
            Modality::Image => f.write_str("image"),
        }
    }
}

/// One user action's worth of generation input, built by the form host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image_ref: Option<String>,
    pub overrides: IndexMap<String, f64>,
}

impl GenerationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_ref: None,
            overrides: IndexMap::new(),
        }
    }
}
