use std::fmt;

use serde_json::Value;

use crate::generation::GenerationMode;

const GENERIC_START_FAILURE: &str = "An error occurred while generating the image.";
const GENERIC_STREAM_FAILURE: &str = "Error occurred during image generation.";
const GENERIC_FETCH_FAILURE: &str = "An error occurred while fetching the image.";
const SERVICE_MESSAGE_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Network(String),
    Service { status: u16, body: String },
}

impl ClientError {
    pub fn network(detail: impl Into<String>) -> Self {
        Self::Network(detail.into())
    }

    pub fn service(status: u16, body: impl Into<String>) -> Self {
        Self::Service {
            status,
            body: body.into(),
        }
    }

    /// Human-readable message the service put in its error body, if any.
    pub fn service_message(&self) -> Option<String> {
        match self {
            Self::Network(_) => None,
            Self::Service { body, .. } => extract_service_message(body),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(detail) => write!(f, "network error: {detail}"),
            Self::Service { status, body } => {
                write!(
                    f,
                    "service error ({status}): {}",
                    truncate_text(body.trim(), SERVICE_MESSAGE_MAX_CHARS)
                )
            }
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPrompt,
    MissingReferenceImage,
    StrengthOutOfRange(f64),
    EmptyModel,
    NoModelForMode(GenerationMode),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPrompt => f.write_str("Prompt is required."),
            Self::MissingReferenceImage => {
                f.write_str("Select a reference image for image-to-image generation.")
            }
            Self::StrengthOutOfRange(value) => write!(
                f,
                "Reference strength must be between 0.0 and 1.0 (got {value})."
            ),
            Self::EmptyModel => f.write_str("Model identifier must not be empty."),
            Self::NoModelForMode(mode) => write!(f, "No models available for mode '{mode}'."),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Start,
    Retrieval,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Retrieval => "retrieval",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationError {
    Transport {
        stage: FailureStage,
        detail: String,
    },
    Service {
        status: u16,
        message: Option<String>,
    },
    StreamTermination(String),
    RetrievalExhausted {
        attempts: u32,
    },
    Resource(String),
}

impl GenerationError {
    pub fn from_client(stage: FailureStage, err: ClientError) -> Self {
        match err {
            ClientError::Network(detail) => Self::Transport { stage, detail },
            ClientError::Service { status, ref body } => {
                let message = extract_service_message(body);
                Self::Service { status, message }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Service { .. } => "service",
            Self::StreamTermination(_) => "stream_termination",
            Self::RetrievalExhausted { .. } => "retrieval_exhausted",
            Self::Resource(_) => "resource",
        }
    }

    /// Text shown to the user when a session fails.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { stage, .. } => match stage {
                FailureStage::Start => GENERIC_START_FAILURE.to_string(),
                FailureStage::Retrieval => GENERIC_FETCH_FAILURE.to_string(),
            },
            Self::Service { status, message } => message.clone().unwrap_or_else(|| {
                format!("The generation service rejected the request (status {status}).")
            }),
            Self::StreamTermination(_) => GENERIC_STREAM_FAILURE.to_string(),
            Self::RetrievalExhausted { attempts } => {
                format!("Gave up waiting for the image after {attempts} attempts.")
            }
            Self::Resource(_) => "The generated image could not be loaded.".to_string(),
        }
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { stage, detail } => {
                write!(f, "transport failure during {}: {detail}", stage.as_str())
            }
            Self::Service { status, message } => match message {
                Some(message) => write!(f, "service error ({status}): {message}"),
                None => write!(f, "service error ({status})"),
            },
            Self::StreamTermination(reason) => {
                write!(f, "progress stream terminated before completion: {reason}")
            }
            Self::RetrievalExhausted { attempts } => {
                write!(f, "result not ready after {attempts} attempts")
            }
            Self::Resource(detail) => write!(f, "resource error: {detail}"),
        }
    }
}

impl std::error::Error for GenerationError {}

fn extract_service_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        return ["error", "message", "detail"]
            .iter()
            .find_map(|key| match parsed.get(*key) {
                Some(Value::String(text)) => Some(text.trim().to_string()),
                Some(Value::Object(inner)) => inner
                    .get("message")
                    .and_then(Value::as_str)
                    .map(|text| text.trim().to_string()),
                _ => None,
            })
            .filter(|text| !text.is_empty())
            .map(|text| truncate_text(&text, SERVICE_MESSAGE_MAX_CHARS));
    }
    if trimmed.starts_with('<') {
        return None;
    }
    Some(truncate_text(trimmed, SERVICE_MESSAGE_MAX_CHARS))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_message_prefers_json_error_field() {
        let err = ClientError::service(400, r#"{"error": "Prompt is required"}"#);
        assert_eq!(err.service_message().as_deref(), Some("Prompt is required"));

        let nested = ClientError::service(500, r#"{"error": {"message": "CUDA out of memory"}}"#);
        assert_eq!(
            nested.service_message().as_deref(),
            Some("CUDA out of memory")
        );
    }

    #[test]
    fn service_message_ignores_html_and_empty_bodies() {
        assert_eq!(
            ClientError::service(502, "<html><body>Bad Gateway</body></html>").service_message(),
            None
        );
        assert_eq!(ClientError::service(500, "   ").service_message(), None);
        assert_eq!(
            ClientError::service(503, "model still loading").service_message().as_deref(),
            Some("model still loading")
        );
        assert_eq!(ClientError::network("refused").service_message(), None);
    }

    #[test]
    fn json_without_message_fields_has_no_service_message() {
        let err = ClientError::service(500, r#"{"status": "boom"}"#);
        assert_eq!(err.service_message(), None);
    }

    #[test]
    fn transport_messages_are_generic_per_stage() {
        let start = GenerationError::from_client(FailureStage::Start, ClientError::network("refused"));
        assert_eq!(
            start.user_message(),
            "An error occurred while generating the image."
        );
        let fetch =
            GenerationError::from_client(FailureStage::Retrieval, ClientError::network("reset"));
        assert_eq!(
            fetch.user_message(),
            "An error occurred while fetching the image."
        );
        assert_eq!(fetch.kind(), "transport");
    }

    #[test]
    fn service_errors_surface_service_text_or_fallback() {
        let with_message = GenerationError::from_client(
            FailureStage::Start,
            ClientError::service(400, r#"{"error": "Prompt is required"}"#),
        );
        assert_eq!(with_message.user_message(), "Prompt is required");

        let without = GenerationError::from_client(FailureStage::Start, ClientError::service(500, ""));
        assert_eq!(
            without.user_message(),
            "The generation service rejected the request (status 500)."
        );
    }

    #[test]
    fn stream_termination_and_exhaustion_messages() {
        let terminated = GenerationError::StreamTermination("connection reset".to_string());
        assert_eq!(
            terminated.user_message(),
            "Error occurred during image generation."
        );
        assert!(terminated.to_string().contains("connection reset"));

        let exhausted = GenerationError::RetrievalExhausted { attempts: 3 };
        assert_eq!(
            exhausted.user_message(),
            "Gave up waiting for the image after 3 attempts."
        );
    }

    #[test]
    fn long_service_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let message = ClientError::service(500, body).service_message().unwrap_or_default();
        assert_eq!(message.chars().count(), SERVICE_MESSAGE_MAX_CHARS + 1);
        assert!(message.ends_with('…'));
    }
}
