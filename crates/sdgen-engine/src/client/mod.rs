mod dryrun;
mod http;
mod sse;

pub use dryrun::{DryrunConfig, DryrunGenerationClient};
pub use http::HttpGenerationClient;
pub use sse::{SseEvent, SseParser};

use std::time::Duration;

use sdgen_contracts::errors::ClientError;
use sdgen_contracts::generation::{
    FetchOutcome, GenerationParams, ProgressEvent, SessionToken, StartOutcome,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPoll {
    Event(ProgressEvent),
    /// Nothing arrived within the wait.
    Idle,
    Closed,
}

/// Server-push progress channel. Dropping it closes the underlying connection.
pub trait ProgressSource: Send {
    fn poll_next(&mut self, wait: Duration) -> Result<StreamPoll, ClientError>;
}

pub type ProgressStream = Box<dyn ProgressSource>;

pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    fn start_generation(&self, params: &GenerationParams) -> Result<StartOutcome, ClientError>;

    fn open_progress_stream(&self, token: &SessionToken) -> Result<ProgressStream, ClientError>;

    /// `NotYetReady` is an expected answer while the service is still working.
    fn fetch_result(&self, token: &SessionToken) -> Result<FetchOutcome, ClientError>;

    fn download_result(&self, url: &str) -> Result<Vec<u8>, ClientError>;

    fn supports_progress_stream(&self) -> bool {
        true
    }
}

/// Reads a stream to its end, stopping after the first error.
#[cfg(test)]
pub(crate) fn drain_stream(
    mut stream: ProgressStream,
) -> Vec<Result<ProgressEvent, ClientError>> {
    let mut items = Vec::new();
    loop {
        match stream.poll_next(Duration::from_millis(50)) {
            Ok(StreamPoll::Event(event)) => items.push(Ok(event)),
            Ok(StreamPoll::Idle) => {}
            Ok(StreamPoll::Closed) => return items,
            Err(err) => {
                items.push(Err(err));
                return items;
            }
        }
    }
}
