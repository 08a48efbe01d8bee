use std::env;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::models::DEFAULT_MODEL;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:5000";
pub const DEFAULT_START_PATH: &str = "start-generation";
pub const DEFAULT_PROGRESS_PATH: &str = "generate-progress";
pub const DEFAULT_RESULT_PATH: &str = "get-image";
pub const DEFAULT_POLL_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_REQUEST_TIMEOUT_S: f64 = 30.0;
pub const DEFAULT_STREAM_READ_INTERVAL_MS: u64 = 5000;

/// How the start request body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartEncoding {
    #[default]
    Json,
    Multipart,
}

impl StartEncoding {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "multipart" | "form" | "form-data" => Some(Self::Multipart),
            _ => None,
        }
    }
}

/// Which transport learns that a result is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressTransport {
    #[default]
    Stream,
    Poll,
}

impl ProgressTransport {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stream" | "sse" | "push" => Some(Self::Stream),
            "poll" | "pull" | "polling" => Some(Self::Poll),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
        }
    }
}

/// Read from `SDGEN_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub api_base: String,
    pub start_path: String,
    pub progress_path: String,
    pub result_path: String,
    pub start_encoding: StartEncoding,
    pub request_timeout: Duration,
    /// Bounds the wait for progress stream headers and each blocking stream read.
    pub stream_read_interval: Duration,
    pub transport: ProgressTransport,
    pub poll_backoff: Duration,
    pub poll_max_attempts: Option<NonZeroU32>,
    pub default_model: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            start_path: DEFAULT_START_PATH.to_string(),
            progress_path: DEFAULT_PROGRESS_PATH.to_string(),
            result_path: DEFAULT_RESULT_PATH.to_string(),
            start_encoding: StartEncoding::Json,
            request_timeout: Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT_S),
            stream_read_interval: Duration::from_millis(DEFAULT_STREAM_READ_INTERVAL_MS),
            transport: ProgressTransport::Stream,
            poll_backoff: Duration::from_millis(DEFAULT_POLL_BACKOFF_MS),
            poll_max_attempts: None,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let api_base = non_empty("SDGEN_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.api_base);
        let path = |key: &str, default: String| {
            non_empty(key)
                .map(|value| value.trim_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(default)
        };
        let request_timeout_s = non_empty("SDGEN_REQUEST_TIMEOUT")
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S)
            .clamp(1.0, 600.0);
        let poll_backoff_ms = non_empty("SDGEN_POLL_BACKOFF_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_BACKOFF_MS)
            .clamp(10, 60_000);
        let poll_max_attempts = non_empty("SDGEN_POLL_MAX_ATTEMPTS")
            .and_then(|value| value.parse::<u32>().ok())
            .and_then(NonZeroU32::new);
        let stream_read_interval_ms = non_empty("SDGEN_STREAM_READ_INTERVAL_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_STREAM_READ_INTERVAL_MS)
            .clamp(100, 60_000);

        Self {
            api_base,
            start_path: path("SDGEN_START_PATH", defaults.start_path),
            progress_path: path("SDGEN_PROGRESS_PATH", defaults.progress_path),
            result_path: path("SDGEN_RESULT_PATH", defaults.result_path),
            start_encoding: non_empty("SDGEN_START_ENCODING")
                .and_then(|value| StartEncoding::parse(&value))
                .unwrap_or(defaults.start_encoding),
            request_timeout: Duration::from_secs_f64(request_timeout_s),
            stream_read_interval: Duration::from_millis(stream_read_interval_ms),
            transport: non_empty("SDGEN_PROGRESS_TRANSPORT")
                .and_then(|value| ProgressTransport::parse(&value))
                .unwrap_or(defaults.transport),
            poll_backoff: Duration::from_millis(poll_backoff_ms),
            poll_max_attempts,
            default_model: non_empty("SDGEN_DEFAULT_MODEL").unwrap_or(defaults.default_model),
        }
    }

    pub fn start_url(&self) -> String {
        format!("{}/{}", self.api_base, self.start_path)
    }
}
