use std::num::NonZeroU32;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use sdgen_contracts::config::{ProgressTransport, ServiceConfig};
use sdgen_contracts::errors::{FailureStage, GenerationError};
use sdgen_contracts::generation::{
    FetchOutcome, GenerationParams, ProgressEvent, ResultPayload, SessionToken, StartOutcome,
};

use crate::client::{GenerationClient, StreamPoll};

const WORKER_THREAD_NAME: &str = "sdgen-acquisition";
const STREAM_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Receives the outcome of one acquisition. `on_ready` and `on_failure` are
/// terminal: at most one of them fires, and nothing fires after it.
pub trait AcquisitionSink: Send + 'static {
    fn on_started(&mut self, _token: &SessionToken) {}
    fn on_progress(&mut self, percent: f64);
    fn on_ready(&mut self, bytes: Vec<u8>);
    fn on_failure(&mut self, error: GenerationError);
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPolicy {
    pub transport: ProgressTransport,
    pub backoff: Duration,
    /// `None` polls until the result is ready or the handle is cancelled.
    pub max_attempts: Option<NonZeroU32>,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            transport: ProgressTransport::Stream,
            backoff: Duration::from_millis(1000),
            max_attempts: None,
        }
    }
}

impl AcquisitionPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            transport: config.transport,
            backoff: config.poll_backoff,
            max_attempts: config.poll_max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateStatus {
    Open,
    Finished,
    Cancelled,
}

struct GateState {
    status: GateStatus,
    sink: Option<Box<dyn AcquisitionSink>>,
}

struct Gate {
    state: Mutex<GateState>,
}

impl Gate {
    fn new(sink: Box<dyn AcquisitionSink>) -> Self {
        Self {
            state: Mutex::new(GateState {
                status: GateStatus::Open,
                sink: Some(sink),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> GateStatus {
        self.lock().status
    }

    fn is_open(&self) -> bool {
        self.status() == GateStatus::Open
    }

    /// `false` once the gate is closed.
    fn deliver(&self, callback: impl FnOnce(&mut dyn AcquisitionSink)) -> bool {
        let mut state = self.lock();
        if state.status != GateStatus::Open {
            return false;
        }
        match state.sink.as_mut() {
            Some(sink) => {
                callback(sink.as_mut());
                true
            }
            None => false,
        }
    }

    fn finish(&self, callback: impl FnOnce(&mut dyn AcquisitionSink)) -> bool {
        let mut state = self.lock();
        if state.status != GateStatus::Open {
            return false;
        }
        state.status = GateStatus::Finished;
        match state.sink.take() {
            Some(mut sink) => {
                callback(sink.as_mut());
                true
            }
            None => false,
        }
    }

    fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.status != GateStatus::Open {
            return false;
        }
        state.status = GateStatus::Cancelled;
        state.sink = None;
        true
    }
}

/// Owner's side of a running acquisition. Dropping it cancels.
pub struct AcquisitionHandle {
    gate: Arc<Gate>,
    wake: Option<mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl AcquisitionHandle {
    /// `true` when the acquisition was still running. The worker drops any open
    /// stream within one stream check interval.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.gate.cancel();
        // Disconnecting the wake channel interrupts a pending backoff.
        self.wake.take();
        cancelled
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.status() == GateStatus::Cancelled
    }

    pub fn worker_exited(&self) -> bool {
        self.worker
            .as_ref()
            .map(thread::JoinHandle::is_finished)
            .unwrap_or(true)
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

enum Job {
    Submit(GenerationParams),
    Resume(StartOutcome),
}

enum StreamEnd {
    Completed,
    Closed,
}

#[derive(Clone)]
pub struct ProgressAcquirer {
    client: Arc<dyn GenerationClient>,
    policy: AcquisitionPolicy,
}

impl ProgressAcquirer {
    pub fn new(client: Arc<dyn GenerationClient>, policy: AcquisitionPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &Arc<dyn GenerationClient> {
        &self.client
    }

    pub fn policy(&self) -> &AcquisitionPolicy {
        &self.policy
    }

    pub fn acquire(
        &self,
        outcome: StartOutcome,
        sink: impl AcquisitionSink,
    ) -> std::io::Result<AcquisitionHandle> {
        self.spawn(Job::Resume(outcome), Box::new(sink))
    }

    /// Starts the generation on the worker thread, then follows it.
    pub fn submit(
        &self,
        params: GenerationParams,
        sink: impl AcquisitionSink,
    ) -> std::io::Result<AcquisitionHandle> {
        self.spawn(Job::Submit(params), Box::new(sink))
    }

    fn spawn(&self, job: Job, sink: Box<dyn AcquisitionSink>) -> std::io::Result<AcquisitionHandle> {
        let gate = Arc::new(Gate::new(sink));
        let (wake_tx, wake_rx) = mpsc::channel();
        let worker = AcquisitionWorker {
            client: Arc::clone(&self.client),
            policy: self.policy.clone(),
            gate: Arc::clone(&gate),
            wake: wake_rx,
        };
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run(job))?;
        Ok(AcquisitionHandle {
            gate,
            wake: Some(wake_tx),
            worker: Some(handle),
        })
    }
}

struct AcquisitionWorker {
    client: Arc<dyn GenerationClient>,
    policy: AcquisitionPolicy,
    gate: Arc<Gate>,
    wake: mpsc::Receiver<()>,
}

impl AcquisitionWorker {
    fn run(self, job: Job) {
        let outcome = match job {
            Job::Resume(outcome) => outcome,
            Job::Submit(params) => {
                if !self.gate.is_open() {
                    return;
                }
                match self.client.start_generation(&params) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.fail(GenerationError::from_client(FailureStage::Start, err));
                        return;
                    }
                }
            }
        };

        match outcome {
            StartOutcome::Immediate(payload) => self.deliver_immediate(payload),
            StartOutcome::Token(token) => {
                if !self.gate.deliver(|sink| sink.on_started(&token)) {
                    return;
                }
                match self.follow_stream(&token) {
                    Ok(StreamEnd::Completed) => self.retrieve(&token),
                    Ok(StreamEnd::Closed) => {}
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    fn deliver_immediate(&self, payload: ResultPayload) {
        let token = SessionToken::local();
        if !self.gate.deliver(|sink| sink.on_started(&token)) {
            return;
        }
        let bytes = match payload {
            ResultPayload::Bytes(bytes) => bytes,
            ResultPayload::Url(url) => match self.client.download_result(&url) {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.fail(GenerationError::from_client(FailureStage::Retrieval, err));
                    return;
                }
            },
        };
        self.gate.finish(move |sink| sink.on_ready(bytes));
    }

    fn follow_stream(&self, token: &SessionToken) -> Result<StreamEnd, GenerationError> {
        if self.policy.transport == ProgressTransport::Poll
            || !self.client.supports_progress_stream()
        {
            return Ok(StreamEnd::Completed);
        }
        let mut stream = self
            .client
            .open_progress_stream(token)
            .map_err(|err| GenerationError::StreamTermination(format!("open failed: {err}")))?;
        loop {
            if !self.gate.is_open() {
                return Ok(StreamEnd::Closed);
            }
            match stream.poll_next(STREAM_CHECK_INTERVAL) {
                Ok(StreamPoll::Idle) => {}
                Ok(StreamPoll::Event(ProgressEvent::Progress(raw))) => {
                    let Some(percent) = normalize_progress(raw) else {
                        continue;
                    };
                    if !self.gate.deliver(|sink| sink.on_progress(percent)) {
                        return Ok(StreamEnd::Closed);
                    }
                }
                Ok(StreamPoll::Event(ProgressEvent::Completed)) => return Ok(StreamEnd::Completed),
                Ok(StreamPoll::Closed) => break,
                Err(err) => return Err(GenerationError::StreamTermination(err.to_string())),
            }
        }
        if !self.gate.is_open() {
            return Ok(StreamEnd::Closed);
        }
        Err(GenerationError::StreamTermination(
            "stream closed before completion".to_string(),
        ))
    }

    fn retrieve(&self, token: &SessionToken) {
        let mut attempts = 0u32;
        loop {
            if !self.gate.is_open() {
                return;
            }
            attempts += 1;
            match self.client.fetch_result(token) {
                Ok(FetchOutcome::ResultReady(bytes)) => {
                    self.gate.finish(move |sink| sink.on_ready(bytes));
                    return;
                }
                Ok(FetchOutcome::NotYetReady) => {}
                Err(err) => {
                    self.fail(GenerationError::from_client(FailureStage::Retrieval, err));
                    return;
                }
            }
            if let Some(limit) = self.policy.max_attempts {
                if attempts >= limit.get() {
                    self.fail(GenerationError::RetrievalExhausted { attempts });
                    return;
                }
            }
            if !self.wait_backoff() {
                return;
            }
        }
    }

    /// `false` when cancelled meanwhile.
    fn wait_backoff(&self) -> bool {
        matches!(
            self.wake.recv_timeout(self.policy.backoff),
            Err(mpsc::RecvTimeoutError::Timeout)
        )
    }

    fn fail(&self, error: GenerationError) {
        self.gate.finish(move |sink| sink.on_failure(error));
    }
}

fn normalize_progress(raw: f64) -> Option<f64> {
    if raw.is_nan() {
        return None;
    }
    Some(raw.clamp(0.0, 100.0))
}
