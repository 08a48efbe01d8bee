use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CFG_SCALE: f64 = 8.0;
pub const DEFAULT_STEPS: u32 = 50;
pub const DEFAULT_SAMPLER: &str = "ddpm";
pub const DEFAULT_REFERENCE_STRENGTH: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GenerationMode {
    #[default]
    #[serde(rename = "text-to-image")]
    TextToImage,
    #[serde(rename = "image-to-image")]
    ImageToImage,
}

impl GenerationMode {
    /// Wire name, also used as the model capability key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text-to-image",
            Self::ImageToImage => "image-to-image",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "txt2img" | "text-to-image" | "text_to_image" | "t2i" => {
                Some(Self::TextToImage)
            }
            "image" | "img2img" | "image-to-image" | "image_to_image" | "i2i" => {
                Some(Self::ImageToImage)
            }
            _ => None,
        }
    }

    pub fn requires_reference(self) -> bool {
        matches!(self, Self::ImageToImage)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    pub seed: Option<i64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            negative_prompt: String::new(),
            cfg_scale: DEFAULT_CFG_SCALE,
            steps: DEFAULT_STEPS,
            sampler: DEFAULT_SAMPLER.to_string(),
            seed: None,
        }
    }
}

fn default_cfg_scale() -> f64 {
    DEFAULT_CFG_SCALE
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_sampler() -> String {
    DEFAULT_SAMPLER.to_string()
}

/// Everything one submission sends to the service, captured by value at submit time.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub mode: GenerationMode,
    pub model: String,
    pub reference_image: Option<Vec<u8>>,
    pub strength: f64,
    pub options: GenerationOptions,
}

impl GenerationParams {
    pub fn text_to_image(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: GenerationMode::TextToImage,
            model: model.into(),
            reference_image: None,
            strength: DEFAULT_REFERENCE_STRENGTH,
            options: GenerationOptions::default(),
        }
    }

    /// Strength is only sent alongside a reference image.
    pub fn effective_strength(&self) -> Option<f64> {
        match self.mode {
            GenerationMode::ImageToImage if self.reference_image.is_some() => Some(self.strength),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Token for submissions the service answered synchronously.
    pub fn local() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    Progress(f64),
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPayload {
    Bytes(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Token(SessionToken),
    Immediate(ResultPayload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    ResultReady(Vec<u8>),
    NotYetReady,
}
