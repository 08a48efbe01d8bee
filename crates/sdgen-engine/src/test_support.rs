use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sdgen_contracts::errors::{ClientError, GenerationError};
use sdgen_contracts::generation::{
    FetchOutcome, GenerationParams, ProgressEvent, SessionToken, StartOutcome,
};

use crate::acquisition::AcquisitionSink;
use crate::client::{GenerationClient, ProgressSource, ProgressStream, StreamPoll};

pub(crate) const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum StreamScript {
    Events(Vec<Result<ProgressEvent, ClientError>>),
    /// Frames are pushed by the test; the stream ends when the sender drops.
    Live(mpsc::Receiver<Result<ProgressEvent, ClientError>>),
    OpenError(ClientError),
}

#[derive(Default)]
pub(crate) struct ScriptedClient {
    starts: Mutex<VecDeque<Result<StartOutcome, ClientError>>>,
    streams: Mutex<HashMap<SessionToken, StreamScript>>,
    fetches: Mutex<HashMap<SessionToken, VecDeque<Result<FetchOutcome, ClientError>>>>,
    downloads: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    started: Mutex<Vec<GenerationParams>>,
    no_stream_support: bool,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn without_stream_support(mut self) -> Self {
        self.no_stream_support = true;
        self
    }

    pub(crate) fn start(self, outcome: Result<StartOutcome, ClientError>) -> Self {
        self.starts.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn start_token(self, token: &str) -> Self {
        self.start(Ok(StartOutcome::Token(SessionToken::from(token))))
    }

    pub(crate) fn stream(self, token: &str, script: StreamScript) -> Self {
        self.streams
            .lock()
            .unwrap()
            .insert(SessionToken::from(token), script);
        self
    }

    pub(crate) fn stream_events(self, token: &str, events: Vec<ProgressEvent>) -> Self {
        self.stream(token, StreamScript::Events(events.into_iter().map(Ok).collect()))
    }

    /// Once the queue is drained every further fetch answers `NotYetReady`.
    pub(crate) fn fetches(
        self,
        token: &str,
        outcomes: Vec<Result<FetchOutcome, ClientError>>,
    ) -> Self {
        self.fetches
            .lock()
            .unwrap()
            .insert(SessionToken::from(token), outcomes.into_iter().collect());
        self
    }

    pub(crate) fn download(self, url: &str, bytes: Vec<u8>) -> Self {
        self.downloads
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Params of every `start_generation` call, oldest first.
    pub(crate) fn started(&self) -> Vec<GenerationParams> {
        self.started.lock().unwrap().clone()
    }

    pub(crate) fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl GenerationClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start_generation(&self, params: &GenerationParams) -> Result<StartOutcome, ClientError> {
        self.record(format!("start:{}", params.prompt));
        self.started.lock().unwrap().push(params.clone());
        self.starts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::service(500, "no scripted start")))
    }

    fn open_progress_stream(&self, token: &SessionToken) -> Result<ProgressStream, ClientError> {
        self.record(format!("stream:{token}"));
        match self.streams.lock().unwrap().remove(token) {
            Some(StreamScript::Events(events)) => {
                Ok(Box::new(ScriptedStream::Queued(events.into_iter().collect())))
            }
            Some(StreamScript::Live(rx)) => Ok(Box::new(ScriptedStream::Live(rx))),
            Some(StreamScript::OpenError(err)) => Err(err),
            None => Err(ClientError::network(format!("no scripted stream for {token}"))),
        }
    }

    fn fetch_result(&self, token: &SessionToken) -> Result<FetchOutcome, ClientError> {
        self.record(format!("fetch:{token}"));
        self.fetches
            .lock()
            .unwrap()
            .get_mut(token)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(FetchOutcome::NotYetReady))
    }

    fn download_result(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        self.record(format!("download:{url}"));
        self.downloads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::service(404, "no scripted download"))
    }

    fn supports_progress_stream(&self) -> bool {
        !self.no_stream_support
    }
}

enum ScriptedStream {
    Queued(VecDeque<Result<ProgressEvent, ClientError>>),
    Live(mpsc::Receiver<Result<ProgressEvent, ClientError>>),
}

impl ProgressSource for ScriptedStream {
    fn poll_next(&mut self, wait: Duration) -> Result<StreamPoll, ClientError> {
        match self {
            Self::Queued(items) => match items.pop_front() {
                Some(item) => item.map(StreamPoll::Event),
                None => Ok(StreamPoll::Closed),
            },
            Self::Live(rx) => match rx.recv_timeout(wait) {
                Ok(item) => item.map(StreamPoll::Event),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(StreamPoll::Idle),
                Err(mpsc::RecvTimeoutError::Disconnected) => Ok(StreamPoll::Closed),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkEvent {
    Started(SessionToken),
    Progress(f64),
    Ready(Vec<u8>),
    Failure(GenerationError),
}

impl SinkEvent {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failure(_))
    }
}

/// Forwards every callback to a channel the test reads from.
pub(crate) struct RecordingSink {
    tx: mpsc::Sender<SinkEvent>,
}

impl RecordingSink {
    pub(crate) fn pair() -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl AcquisitionSink for RecordingSink {
    fn on_started(&mut self, token: &SessionToken) {
        let _ = self.tx.send(SinkEvent::Started(token.clone()));
    }

    fn on_progress(&mut self, percent: f64) {
        let _ = self.tx.send(SinkEvent::Progress(percent));
    }

    fn on_ready(&mut self, bytes: Vec<u8>) {
        let _ = self.tx.send(SinkEvent::Ready(bytes));
    }

    fn on_failure(&mut self, error: GenerationError) {
        let _ = self.tx.send(SinkEvent::Failure(error));
    }
}

/// Collects sink events up to and including the first terminal one.
pub(crate) fn collect_until_terminal(rx: &mpsc::Receiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(SETTLE_TIMEOUT) {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

/// Polls `condition` until it holds or the settle timeout passes.
pub(crate) fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
