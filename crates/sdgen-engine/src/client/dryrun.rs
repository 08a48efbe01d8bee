use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use image::{ImageFormat, Rgb, RgbImage};
use sdgen_contracts::errors::ClientError;
use sdgen_contracts::generation::{
    FetchOutcome, GenerationParams, ProgressEvent, ResultPayload, SessionToken, StartOutcome,
};
use sha2::{Digest, Sha256};

use super::{GenerationClient, ProgressSource, ProgressStream, StreamPoll};

const DRYRUN_URL_SCHEME: &str = "dryrun://";

#[derive(Debug, Clone, PartialEq)]
pub struct DryrunConfig {
    pub steps: u32,
    pub step_delay: Duration,
    /// `fetch_result` answers `NotYetReady` this many times per job.
    pub pending_polls: u32,
    /// Answer `start_generation` with a `dryrun://` result URL instead of a token.
    pub immediate: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for DryrunConfig {
    fn default() -> Self {
        Self {
            steps: 50,
            step_delay: Duration::from_millis(20),
            pending_polls: 0,
            immediate: false,
            width: 64,
            height: 64,
        }
    }
}

#[derive(Debug)]
struct DryrunJob {
    color: (u8, u8, u8),
    polls_remaining: u32,
}

/// Renders a flat JPEG whose colour is derived from the prompt, seed and reference image.
pub struct DryrunGenerationClient {
    config: DryrunConfig,
    jobs: Mutex<HashMap<SessionToken, DryrunJob>>,
}

impl DryrunGenerationClient {
    pub fn new(config: DryrunConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DryrunConfig {
        &self.config
    }

    fn render(&self, color: (u8, u8, u8)) -> Result<Vec<u8>, ClientError> {
        let (r, g, b) = color;
        let mut image = RgbImage::new(self.config.width.max(1), self.config.height.max(1));
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, ImageFormat::Jpeg)
            .map_err(|err| ClientError::service(500, format!("dryrun encode failed: {err}")))?;
        Ok(encoded.into_inner())
    }

    fn jobs(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SessionToken, DryrunJob>>, ClientError> {
        self.jobs
            .lock()
            .map_err(|_| ClientError::service(500, "dryrun job table poisoned"))
    }
}

impl Default for DryrunGenerationClient {
    fn default() -> Self {
        Self::new(DryrunConfig::default())
    }
}

impl GenerationClient for DryrunGenerationClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn start_generation(&self, params: &GenerationParams) -> Result<StartOutcome, ClientError> {
        if params.prompt.trim().is_empty() {
            return Err(ClientError::service(
                400,
                r#"{"error": "Prompt is required"}"#,
            ));
        }
        let token = SessionToken::new(uuid::Uuid::new_v4().to_string());
        self.jobs()?.insert(
            token.clone(),
            DryrunJob {
                color: color_from_params(params),
                polls_remaining: if self.config.immediate {
                    0
                } else {
                    self.config.pending_polls
                },
            },
        );
        if self.config.immediate {
            return Ok(StartOutcome::Immediate(ResultPayload::Url(format!(
                "{DRYRUN_URL_SCHEME}{token}"
            ))));
        }
        Ok(StartOutcome::Token(token))
    }

    fn open_progress_stream(&self, token: &SessionToken) -> Result<ProgressStream, ClientError> {
        if !self.jobs()?.contains_key(token) {
            return Err(unknown_token(token));
        }
        Ok(Box::new(DryrunStream {
            steps: self.config.steps.max(1),
            sent: 0,
            delay: self.config.step_delay,
            next_at: Instant::now() + self.config.step_delay,
            completed: false,
        }))
    }

    fn fetch_result(&self, token: &SessionToken) -> Result<FetchOutcome, ClientError> {
        let color = {
            let mut jobs = self.jobs()?;
            let job = jobs.get_mut(token).ok_or_else(|| unknown_token(token))?;
            if job.polls_remaining > 0 {
                job.polls_remaining -= 1;
                return Ok(FetchOutcome::NotYetReady);
            }
            job.color
        };
        self.render(color).map(FetchOutcome::ResultReady)
    }

    fn download_result(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let Some(raw_token) = url.strip_prefix(DRYRUN_URL_SCHEME) else {
            return Err(ClientError::network(format!(
                "dryrun client cannot download {url}"
            )));
        };
        match self.fetch_result(&SessionToken::from(raw_token))? {
            FetchOutcome::ResultReady(bytes) => Ok(bytes),
            FetchOutcome::NotYetReady => Err(ClientError::service(404, "result not ready")),
        }
    }
}

struct DryrunStream {
    steps: u32,
    sent: u32,
    delay: Duration,
    next_at: Instant,
    completed: bool,
}

impl ProgressSource for DryrunStream {
    fn poll_next(&mut self, wait: Duration) -> Result<StreamPoll, ClientError> {
        if self.sent >= self.steps {
            if self.completed {
                return Ok(StreamPoll::Closed);
            }
            self.completed = true;
            return Ok(StreamPoll::Event(ProgressEvent::Completed));
        }
        let remaining = self.next_at.saturating_duration_since(Instant::now());
        if remaining > wait {
            thread::sleep(wait);
            return Ok(StreamPoll::Idle);
        }
        thread::sleep(remaining);
        self.sent += 1;
        self.next_at = Instant::now() + self.delay;
        Ok(StreamPoll::Event(ProgressEvent::Progress(
            f64::from(self.sent) * 100.0 / f64::from(self.steps),
        )))
    }
}

fn unknown_token(token: &SessionToken) -> ClientError {
    ClientError::service(404, format!("unknown image id {token}"))
}

fn color_from_params(params: &GenerationParams) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(params.prompt.as_bytes());
    hasher.update(params.options.seed.unwrap_or_default().to_be_bytes());
    if let Some(reference) = params
        .reference_image
        .as_ref()
        .filter(|_| params.effective_strength().is_some())
    {
        hasher.update(reference);
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::drain_stream;

    fn quick() -> DryrunConfig {
        DryrunConfig {
            steps: 4,
            step_delay: Duration::ZERO,
            ..DryrunConfig::default()
        }
    }

    #[test]
    fn stream_counts_up_to_completion() -> anyhow::Result<()> {
        let client = DryrunGenerationClient::new(quick());
        let StartOutcome::Token(token) =
            client.start_generation(&GenerationParams::text_to_image("a fox", "sd-v1-5"))?
        else {
            anyhow::bail!("expected a token");
        };
        let frames = drain_stream(client.open_progress_stream(&token)?)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(
            frames,
            vec![
                ProgressEvent::Progress(25.0),
                ProgressEvent::Progress(50.0),
                ProgressEvent::Progress(75.0),
                ProgressEvent::Progress(100.0),
                ProgressEvent::Completed,
            ]
        );
        Ok(())
    }

    #[test]
    fn fetch_stays_pending_for_configured_polls() -> anyhow::Result<()> {
        let client = DryrunGenerationClient::new(DryrunConfig {
            pending_polls: 2,
            ..quick()
        });
        let StartOutcome::Token(token) =
            client.start_generation(&GenerationParams::text_to_image("a fox", "sd-v1-5"))?
        else {
            anyhow::bail!("expected a token");
        };
        assert_eq!(client.fetch_result(&token)?, FetchOutcome::NotYetReady);
        assert_eq!(client.fetch_result(&token)?, FetchOutcome::NotYetReady);
        let FetchOutcome::ResultReady(bytes) = client.fetch_result(&token)? else {
            anyhow::bail!("expected image bytes");
        };
        assert_eq!(image::guess_format(&bytes)?, ImageFormat::Jpeg);
        Ok(())
    }

    #[test]
    fn empty_prompt_is_rejected_like_the_service() {
        let client = DryrunGenerationClient::new(quick());
        let err = client
            .start_generation(&GenerationParams::text_to_image("  ", "sd-v1-5"))
            .err();
        assert_eq!(
            err.as_ref().and_then(ClientError::service_message).as_deref(),
            Some("Prompt is required")
        );
    }

    #[test]
    fn immediate_mode_hands_back_a_downloadable_url() -> anyhow::Result<()> {
        let client = DryrunGenerationClient::new(DryrunConfig {
            immediate: true,
            ..quick()
        });
        let outcome = client.start_generation(&GenerationParams::text_to_image("a fox", "m"))?;
        let StartOutcome::Immediate(ResultPayload::Url(url)) = outcome else {
            anyhow::bail!("expected an immediate URL, got {outcome:?}");
        };
        assert!(url.starts_with("dryrun://"));
        let bytes = client.download_result(&url)?;
        assert_eq!(image::guess_format(&bytes)?, ImageFormat::Jpeg);
        Ok(())
    }

    #[test]
    fn slow_frames_report_idle_between_steps() -> anyhow::Result<()> {
        let client = DryrunGenerationClient::new(DryrunConfig {
            steps: 1,
            step_delay: Duration::from_secs(60),
            ..quick()
        });
        let StartOutcome::Token(token) =
            client.start_generation(&GenerationParams::text_to_image("a fox", "m"))?
        else {
            anyhow::bail!("expected a token");
        };
        let mut stream = client.open_progress_stream(&token)?;
        assert_eq!(stream.poll_next(Duration::from_millis(5))?, StreamPoll::Idle);
        Ok(())
    }

    #[test]
    fn unknown_tokens_are_service_errors() {
        let client = DryrunGenerationClient::new(quick());
        let token = SessionToken::from("missing");
        assert!(matches!(
            client.fetch_result(&token),
            Err(ClientError::Service { status: 404, .. })
        ));
        assert!(client.open_progress_stream(&token).is_err());
        assert!(client.download_result("https://example.com/a.jpg").is_err());
    }

    #[test]
    fn color_depends_on_prompt_and_seed() {
        let base = GenerationParams::text_to_image("a fox", "m");
        let mut seeded = base.clone();
        seeded.options.seed = Some(7);
        assert_eq!(color_from_params(&base), color_from_params(&base.clone()));
        assert_ne!(color_from_params(&base), color_from_params(&seeded));
    }
}
