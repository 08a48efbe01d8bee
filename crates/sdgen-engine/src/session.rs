use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

use sdgen_contracts::errors::{FailureStage, GenerationError, ValidationError};
use sdgen_contracts::events::{EventPayload, EventWriter};
use sdgen_contracts::generation::{
    GenerationMode, GenerationOptions, GenerationParams, SessionToken, DEFAULT_REFERENCE_STRENGTH,
};
use sdgen_contracts::models::ModelSelector;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::acquisition::{AcquisitionHandle, AcquisitionSink, ProgressAcquirer};
use crate::resources::{ResourceError, ResourceHandle, ResourceSlot, ResourceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Submitting,
    AwaitingResult,
    Ready,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Submitting => "submitting",
            Self::AwaitingResult => "awaiting_result",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitting | Self::AwaitingResult)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub prompt: String,
    pub mode: GenerationMode,
    pub model: String,
    pub reference_image: Option<ResourceHandle>,
    pub reference_strength: f64,
    pub options: GenerationOptions,
    pub status: SessionStatus,
    pub progress_fraction: f64,
    pub result_handle: Option<ResourceHandle>,
    pub error_message: Option<String>,
    pub validation_message: Option<String>,
    pub session_token: Option<SessionToken>,
    pub submission: u64,
    pub model_fallback: Option<String>,
}

impl SessionSnapshot {
    fn new(model: String) -> Self {
        Self {
            prompt: String::new(),
            mode: GenerationMode::TextToImage,
            model,
            reference_image: None,
            reference_strength: DEFAULT_REFERENCE_STRENGTH,
            options: GenerationOptions::default(),
            status: SessionStatus::Idle,
            progress_fraction: 0.0,
            result_handle: None,
            error_message: None,
            validation_message: None,
            session_token: None,
            submission: 0,
            model_fallback: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Parameter edits are refused while a request is in flight.
    Busy { status: SessionStatus },
    Validation(ValidationError),
    Resource(ResourceError),
    ShutDown,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { status } => write!(
                f,
                "generation in progress ({status}); wait for it to finish before editing"
            ),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Resource(err) => write!(f, "{err}"),
            Self::ShutDown => f.write_str("session has been shut down"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ValidationError> for SessionError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<ResourceError> for SessionError {
    fn from(value: ResourceError) -> Self {
        Self::Resource(value)
    }
}

#[derive(Debug)]
enum UpdateKind {
    Started(SessionToken),
    Progress(f64),
    Ready(Vec<u8>),
    Failed(GenerationError),
}

impl UpdateKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::Progress(_) => "progress",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
struct SessionUpdate {
    submission: u64,
    kind: UpdateKind,
}

struct UpdateSink {
    submission: u64,
    tx: mpsc::Sender<SessionUpdate>,
}

impl UpdateSink {
    fn send(&self, kind: UpdateKind) {
        // The receiver lives as long as the machine; a failed send means it is gone.
        let _ = self.tx.send(SessionUpdate {
            submission: self.submission,
            kind,
        });
    }
}

impl AcquisitionSink for UpdateSink {
    fn on_started(&mut self, token: &SessionToken) {
        self.send(UpdateKind::Started(token.clone()));
    }

    fn on_progress(&mut self, percent: f64) {
        self.send(UpdateKind::Progress(percent));
    }

    fn on_ready(&mut self, bytes: Vec<u8>) {
        self.send(UpdateKind::Ready(bytes));
    }

    fn on_failure(&mut self, error: GenerationError) {
        self.send(UpdateKind::Failed(error));
    }
}

pub struct SessionMachine {
    session: SessionSnapshot,
    resources: ResourceStore,
    events: EventWriter,
    selector: ModelSelector,
    acquirer: ProgressAcquirer,
    active: Option<AcquisitionHandle>,
    updates_tx: mpsc::Sender<SessionUpdate>,
    updates_rx: mpsc::Receiver<SessionUpdate>,
    shut_down: bool,
}

impl SessionMachine {
    pub fn new(
        acquirer: ProgressAcquirer,
        events: EventWriter,
        default_model: impl Into<String>,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel();
        let session = SessionSnapshot::new(default_model.into());
        let machine = Self {
            resources: ResourceStore::new(events.session_id()),
            selector: ModelSelector::new(None),
            events,
            acquirer,
            active: None,
            updates_tx,
            updates_rx,
            shut_down: false,
            session,
        };
        machine.record(
            "session_created",
            json!({
                "model": machine.session.model,
                "mode": machine.session.mode.as_str(),
                "client": machine.acquirer.client().name(),
                "transport": machine.acquirer.policy().transport.as_str(),
            }),
        );
        machine
    }

    pub fn with_selector(mut self, selector: ModelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn session(&self) -> &SessionSnapshot {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.clone()
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Bytes behind a live handle; `None` once the handle was released.
    pub fn resource(&self, handle: &ResourceHandle) -> Option<&[u8]> {
        self.resources.resolve(handle)
    }

    pub fn result_bytes(&self) -> Option<&[u8]> {
        self.session
            .result_handle
            .as_ref()
            .and_then(|handle| self.resources.resolve(handle))
    }

    pub fn live_resources(&self) -> usize {
        self.resources.live_count()
    }

    pub fn has_active_acquisition(&self) -> bool {
        self.active
            .as_ref()
            .map(AcquisitionHandle::is_active)
            .unwrap_or(false)
    }

    pub fn on_prompt_change(&mut self, prompt: impl Into<String>) {
        self.session.prompt = prompt.into();
    }

    pub fn on_mode_change(&mut self, mode: GenerationMode) -> Result<(), SessionError> {
        self.ensure_editable("mode_change")?;
        self.session.mode = mode;
        Ok(())
    }

    pub fn on_model_change(&mut self, model: &str) -> Result<(), SessionError> {
        self.ensure_editable("model_change")?;
        let model = model.trim();
        if model.is_empty() {
            return Err(self.reject("model_change", ValidationError::EmptyModel));
        }
        self.session.model = model.to_string();
        Ok(())
    }

    pub fn on_reference_strength_change(&mut self, strength: f64) -> Result<(), SessionError> {
        self.ensure_editable("reference_strength_change")?;
        if !(0.0..=1.0).contains(&strength) {
            return Err(self.reject(
                "reference_strength_change",
                ValidationError::StrengthOutOfRange(strength),
            ));
        }
        self.session.reference_strength = strength;
        Ok(())
    }

    pub fn on_options_change(&mut self, options: GenerationOptions) -> Result<(), SessionError> {
        self.ensure_editable("options_change")?;
        self.session.options = options;
        Ok(())
    }

    pub fn on_reference_image_selected(
        &mut self,
        bytes: Vec<u8>,
    ) -> Result<ResourceHandle, SessionError> {
        self.ensure_editable("reference_image_selected")?;
        if bytes.is_empty() {
            return Err(self.reject(
                "reference_image_selected",
                ValidationError::MissingReferenceImage,
            ));
        }
        self.release_reference();
        let handle = self.resources.materialize(ResourceSlot::Reference, bytes)?;
        self.record_materialized(&handle);
        self.session.reference_image = Some(handle.clone());
        Ok(handle)
    }

    pub fn on_reference_image_cleared(&mut self) -> Result<(), SessionError> {
        self.ensure_editable("reference_image_cleared")?;
        self.release_reference();
        Ok(())
    }

    /// A submission already in flight is cancelled and superseded. A rejected
    /// submission leaves the status untouched.
    pub fn on_submit(&mut self) -> Result<u64, SessionError> {
        if self.shut_down {
            return Err(SessionError::ShutDown);
        }
        let params = match self.build_params() {
            Ok(params) => params,
            Err(err) => return Err(self.reject("submit", err)),
        };

        self.cancel_active("superseded");
        self.release_result();

        self.session.submission += 1;
        let submission = self.session.submission;
        self.session.status = SessionStatus::Submitting;
        self.session.progress_fraction = 0.0;
        self.session.error_message = None;
        self.session.validation_message = None;
        self.session.session_token = None;
        self.record(
            "submission_started",
            json!({
                "submission": submission,
                "mode": params.mode.as_str(),
                "model": params.model,
                "prompt": params.prompt,
                "strength": params.effective_strength(),
                "has_reference": params.reference_image.is_some(),
                "steps": params.options.steps,
                "seed": params.options.seed,
            }),
        );

        let sink = UpdateSink {
            submission,
            tx: self.updates_tx.clone(),
        };
        match self.acquirer.submit(params, sink) {
            Ok(handle) => self.active = Some(handle),
            Err(err) => self.fail(GenerationError::Transport {
                stage: FailureStage::Start,
                detail: format!("failed to spawn acquisition worker: {err}"),
            }),
        }
        Ok(submission)
    }

    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply(update);
            handled += 1;
        }
        handled
    }

    /// Blocks up to `timeout` for the next update, then drains the rest.
    pub fn wait_for_update(&mut self, timeout: Duration) -> usize {
        match self.updates_rx.recv_timeout(timeout) {
            Ok(update) => {
                self.apply(update);
                1 + self.pump()
            }
            Err(_) => 0,
        }
    }

    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.cancel_active("shutdown");
        for handle in self.resources.release_all() {
            self.record_released(&handle);
        }
        let final_status = self.session.status;
        self.session.reference_image = None;
        self.session.result_handle = None;
        self.session.error_message = None;
        self.session.status = SessionStatus::Idle;
        self.shut_down = true;
        self.record(
            "session_shutdown",
            json!({
                "submission": self.session.submission,
                "final_status": final_status.as_str(),
            }),
        );
    }

    fn build_params(&mut self) -> Result<GenerationParams, ValidationError> {
        if self.session.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if self.session.model.trim().is_empty() {
            return Err(ValidationError::EmptyModel);
        }
        let strength = self.session.reference_strength;
        if !(0.0..=1.0).contains(&strength) {
            return Err(ValidationError::StrengthOutOfRange(strength));
        }
        let mode = self.session.mode;
        let reference_image = if mode.requires_reference() {
            let bytes = self
                .session
                .reference_image
                .as_ref()
                .and_then(|handle| self.resources.resolve(handle))
                .ok_or(ValidationError::MissingReferenceImage)?;
            Some(bytes.to_vec())
        } else {
            None
        };

        let selection = self
            .selector
            .select(&self.session.model, mode)
            .map_err(|_| ValidationError::NoModelForMode(mode))?;
        self.session.model_fallback = selection.fallback_reason.clone();
        if let Some(reason) = &selection.fallback_reason {
            self.record(
                "model_fallback",
                json!({
                    "requested": selection.requested,
                    "selected": selection.model.name,
                    "mode": mode.as_str(),
                    "reason": reason,
                }),
            );
        }

        Ok(GenerationParams {
            prompt: self.session.prompt.clone(),
            mode,
            model: selection.model.name,
            reference_image,
            strength,
            options: self.session.options.clone(),
        })
    }

    fn apply(&mut self, update: SessionUpdate) {
        if update.submission != self.session.submission || !self.session.status.is_in_flight() {
            self.record(
                "stale_update_dropped",
                json!({
                    "submission": update.submission,
                    "current_submission": self.session.submission,
                    "update": update.kind.as_str(),
                }),
            );
            return;
        }
        match update.kind {
            UpdateKind::Started(token) => {
                self.session.status = SessionStatus::AwaitingResult;
                self.session.progress_fraction = 0.0;
                self.record(
                    "generation_started",
                    json!({
                        "submission": update.submission,
                        "token": token.as_str(),
                        "local_token": token.is_local(),
                    }),
                );
                self.session.session_token = Some(token);
            }
            UpdateKind::Progress(percent) => {
                self.session.progress_fraction = percent;
                self.record(
                    "progress",
                    json!({
                        "submission": update.submission,
                        "token": self.token_value(),
                        "percent": percent,
                    }),
                );
            }
            UpdateKind::Ready(bytes) => self.complete(bytes),
            UpdateKind::Failed(err) => self.fail(err),
        }
    }

    fn complete(&mut self, bytes: Vec<u8>) {
        self.active = None;
        self.release_result();
        let digest = hex::encode(Sha256::digest(&bytes));
        let handle = match self.resources.materialize(ResourceSlot::Result, bytes) {
            Ok(handle) => handle,
            Err(err) => {
                self.fail(GenerationError::Resource(err.to_string()));
                return;
            }
        };
        self.record_materialized(&handle);
        self.session.status = SessionStatus::Ready;
        self.session.error_message = None;
        self.record(
            "result_ready",
            json!({
                "submission": self.session.submission,
                "token": self.token_value(),
                "uri": handle.uri(),
                "bytes": handle.len(),
                "mime_type": handle.mime_type(),
                "sha256": digest,
            }),
        );
        self.session.result_handle = Some(handle);
    }

    fn fail(&mut self, err: GenerationError) {
        self.active = None;
        self.release_result();
        let message = err.user_message();
        self.record(
            "generation_failed",
            json!({
                "submission": self.session.submission,
                "token": self.token_value(),
                "kind": err.kind(),
                "message": message,
                "detail": err.to_string(),
            }),
        );
        self.session.status = SessionStatus::Failed;
        self.session.error_message = Some(message);
    }

    fn cancel_active(&mut self, reason: &str) {
        let Some(mut handle) = self.active.take() else {
            return;
        };
        if handle.cancel() {
            self.record(
                "acquisition_cancelled",
                json!({
                    "submission": self.session.submission,
                    "token": self.token_value(),
                    "reason": reason,
                }),
            );
        }
    }

    fn release_result(&mut self) {
        if let Some(handle) = self.session.result_handle.take() {
            if self.resources.release(&handle) {
                self.record_released(&handle);
            }
        }
    }

    fn release_reference(&mut self) {
        if let Some(handle) = self.session.reference_image.take() {
            if self.resources.release(&handle) {
                self.record_released(&handle);
            }
        }
    }

    fn ensure_editable(&self, intent: &str) -> Result<(), SessionError> {
        if self.shut_down {
            return Err(SessionError::ShutDown);
        }
        if self.session.status.is_in_flight() {
            self.record(
                "validation_failed",
                json!({
                    "intent": intent,
                    "reason": "busy",
                    "status": self.session.status.as_str(),
                }),
            );
            return Err(SessionError::Busy {
                status: self.session.status,
            });
        }
        Ok(())
    }

    fn reject(&mut self, intent: &str, err: ValidationError) -> SessionError {
        let message = err.to_string();
        self.record(
            "validation_failed",
            json!({
                "intent": intent,
                "reason": validation_reason(&err),
                "message": message,
                "status": self.session.status.as_str(),
            }),
        );
        self.session.validation_message = Some(message);
        SessionError::Validation(err)
    }

    fn token_value(&self) -> Value {
        self.session
            .session_token
            .as_ref()
            .map(|token| Value::String(token.as_str().to_string()))
            .unwrap_or(Value::Null)
    }

    fn record_materialized(&self, handle: &ResourceHandle) {
        self.record(
            "resource_materialized",
            json!({
                "slot": handle.slot().as_str(),
                "uri": handle.uri(),
                "bytes": handle.len(),
                "mime_type": handle.mime_type(),
            }),
        );
    }

    fn record_released(&self, handle: &ResourceHandle) {
        self.record(
            "resource_released",
            json!({
                "slot": handle.slot().as_str(),
                "uri": handle.uri(),
            }),
        );
    }

    /// Event-log failures never affect session state.
    fn record(&self, event_type: &str, payload: Value) {
        let _ = self.events.emit(event_type, map_object(payload));
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validation_reason(err: &ValidationError) -> &'static str {
    match err {
        ValidationError::EmptyPrompt => "empty_prompt",
        ValidationError::MissingReferenceImage => "missing_reference_image",
        ValidationError::StrengthOutOfRange(_) => "strength_out_of_range",
        ValidationError::EmptyModel => "empty_model",
        ValidationError::NoModelForMode(_) => "no_model_for_mode",
    }
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}
