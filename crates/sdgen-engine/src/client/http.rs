use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use sdgen_contracts::config::{ServiceConfig, StartEncoding};
use sdgen_contracts::errors::ClientError;
use sdgen_contracts::generation::{
    FetchOutcome, GenerationParams, ProgressEvent, ResultPayload, SessionToken, StartOutcome,
};
use serde_json::{json, Map, Value};

use super::sse::{SseEvent, SseParser};
use super::{GenerationClient, ProgressSource, ProgressStream, StreamPoll};

const TOKEN_KEYS: &[&str] = &["image_id", "token", "session_token", "id"];
const URL_KEYS: &[&str] = &["image_url", "url", "result_url"];
const INLINE_IMAGE_KEYS: &[&str] = &["image", "image_base64", "b64_json"];
const STREAM_READ_CHUNK: usize = 4096;
const STREAM_READER_THREAD_NAME: &str = "sdgen-progress-reader";

pub struct HttpGenerationClient {
    config: ServiceConfig,
    http: HttpClient,
    stream_http: HttpClient,
}

impl HttpGenerationClient {
    pub fn new(config: ServiceConfig) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()?;
        // The blocking client applies `timeout` to each body read, so an idle stream
        // wakes its reader once per interval.
        let stream_http = HttpClient::builder()
            .connect_timeout(config.request_timeout)
            .timeout(config.stream_read_interval)
            .build()?;
        Ok(Self {
            config,
            http,
            stream_http,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn start_json(&self, params: &GenerationParams) -> Result<HttpResponse, ClientError> {
        let endpoint = self.config.start_url();
        self.http
            .post(&endpoint)
            .json(&build_start_payload(params))
            .send()
            .map_err(|err| transport_error("start-generation request failed", &err))
    }

    fn start_multipart(&self, params: &GenerationParams) -> Result<HttpResponse, ClientError> {
        let endpoint = self.config.start_url();
        let mut form = MultipartForm::new();
        if let Value::Object(fields) = build_start_payload(params) {
            for (key, value) in fields {
                if key == "reference_image" || value.is_null() {
                    continue;
                }
                form = form.text(key, json_value_to_form_text(&value));
            }
        }
        if let (Some(bytes), Some(_)) = (&params.reference_image, params.effective_strength()) {
            let mime = image::guess_format(bytes)
                .map(|format| format.to_mime_type())
                .unwrap_or("application/octet-stream");
            let part = MultipartPart::bytes(bytes.clone())
                .file_name("reference")
                .mime_str(mime)
                .map_err(|err| transport_error("invalid reference image mime type", &err))?;
            form = form.part("reference_image", part);
        }
        self.http
            .post(&endpoint)
            .multipart(form)
            .send()
            .map_err(|err| transport_error("start-generation form submit failed", &err))
    }
}

impl GenerationClient for HttpGenerationClient {
    fn name(&self) -> &str {
        "http"
    }

    fn start_generation(&self, params: &GenerationParams) -> Result<StartOutcome, ClientError> {
        let response = match self.config.start_encoding {
            StartEncoding::Json => self.start_json(params)?,
            StartEncoding::Multipart => self.start_multipart(params)?,
        };
        let (status, content_type, body) = read_response(response)?;
        parse_start_response(&self.config.api_base, status, content_type.as_deref(), &body)
    }

    fn open_progress_stream(&self, token: &SessionToken) -> Result<ProgressStream, ClientError> {
        let url = token_url(&self.config.api_base, &self.config.progress_path, token)?;
        let response = self
            .stream_http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .map_err(|err| transport_error("progress stream connect failed", &err))?;
        if !response.status().is_success() {
            let (status, _, body) = read_response(response)?;
            return Err(ClientError::service(
                status.as_u16(),
                String::from_utf8_lossy(&body).to_string(),
            ));
        }
        Ok(Box::new(SseProgressStream::spawn(response)?))
    }

    fn fetch_result(&self, token: &SessionToken) -> Result<FetchOutcome, ClientError> {
        let url = token_url(&self.config.api_base, &self.config.result_path, token)?;
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|err| transport_error("result fetch failed", &err))?;
        let (status, content_type, body) = read_response(response)?;
        match classify_fetch_response(status, content_type.as_deref(), body)? {
            FetchClassification::Outcome(outcome) => Ok(outcome),
            FetchClassification::Download(url) => {
                let url = resolve_url(&self.config.api_base, &url);
                self.download_result(&url).map(FetchOutcome::ResultReady)
            }
        }
    }

    fn download_result(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let url = resolve_url(&self.config.api_base, url);
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|err| transport_error("result download failed", &err))?;
        let (status, _, body) = read_response(response)?;
        if !status.is_success() {
            return Err(ClientError::service(
                status.as_u16(),
                String::from_utf8_lossy(&body).to_string(),
            ));
        }
        Ok(body)
    }
}

/// The body is read on its own thread so the consumer can give up between frames.
struct SseProgressStream {
    frames: mpsc::Receiver<Result<ProgressEvent, ClientError>>,
    stop: Arc<AtomicBool>,
    closed: bool,
}

impl SseProgressStream {
    fn spawn<R: Read + Send + 'static>(body: R) -> Result<Self, ClientError> {
        let (frames_tx, frames) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader = SseBodyReader {
            body,
            parser: SseParser::new(),
            stop: Arc::clone(&stop),
            frames: frames_tx,
        };
        thread::Builder::new()
            .name(STREAM_READER_THREAD_NAME.to_string())
            .spawn(move || reader.run())
            .map_err(|err| ClientError::network(format!("progress reader spawn failed: {err}")))?;
        Ok(Self {
            frames,
            stop,
            closed: false,
        })
    }
}

impl ProgressSource for SseProgressStream {
    fn poll_next(&mut self, wait: Duration) -> Result<StreamPoll, ClientError> {
        if self.closed {
            return Ok(StreamPoll::Closed);
        }
        match self.frames.recv_timeout(wait) {
            Ok(Ok(event)) => Ok(StreamPoll::Event(event)),
            Ok(Err(err)) => {
                self.closed = true;
                Err(err)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(StreamPoll::Idle),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Ok(StreamPoll::Closed)
            }
        }
    }
}

impl Drop for SseProgressStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct SseBodyReader<R> {
    body: R,
    parser: SseParser,
    stop: Arc<AtomicBool>,
    frames: mpsc::Sender<Result<ProgressEvent, ClientError>>,
}

impl<R: Read> SseBodyReader<R> {
    /// Returning drops the body, which closes the connection.
    fn run(mut self) {
        let mut buffer = [0u8; STREAM_READ_CHUNK];
        while !self.stop.load(Ordering::SeqCst) {
            match self.body.read(&mut buffer) {
                Ok(0) => {
                    let tail = self.parser.flush();
                    self.forward(tail);
                    return;
                }
                Ok(n) => {
                    let events = self.parser.feed_bytes(&buffer[..n]);
                    if !self.forward(events) {
                        return;
                    }
                }
                Err(err) if is_idle_read(&err) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let _ = self.frames.send(Err(ClientError::network(format!(
                        "progress stream read failed: {err}"
                    ))));
                    return;
                }
            }
        }
    }

    /// `false` once the consumer is gone or an error frame ended the stream.
    fn forward(&self, events: impl IntoIterator<Item = SseEvent>) -> bool {
        for event in events {
            let Some(item) = event.to_progress() else {
                continue;
            };
            let terminal = item.is_err();
            if self.frames.send(item).is_err() || terminal {
                return false;
            }
        }
        true
    }
}

fn is_idle_read(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .map(reqwest::Error::is_timeout)
        .unwrap_or(false)
}

enum FetchClassification {
    Outcome(FetchOutcome),
    Download(String),
}

fn read_response(
    response: HttpResponse,
) -> Result<(StatusCode, Option<String>, Vec<u8>), ClientError> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase());
    let body = response
        .bytes()
        .map_err(|err| transport_error("response body read failed", &err))?
        .to_vec();
    Ok((status, content_type, body))
}

fn build_start_payload(params: &GenerationParams) -> Value {
    let mut payload = Map::new();
    payload.insert("prompt".to_string(), json!(params.prompt));
    payload.insert("mode".to_string(), json!(params.mode.as_str()));
    payload.insert("model".to_string(), json!(params.model));
    payload.insert(
        "negative_prompt".to_string(),
        json!(params.options.negative_prompt),
    );
    payload.insert("cfg_scale".to_string(), json!(params.options.cfg_scale));
    payload.insert("steps".to_string(), json!(params.options.steps));
    payload.insert("sampler".to_string(), json!(params.options.sampler));
    payload.insert("seed".to_string(), json!(params.options.seed));
    if let (Some(bytes), Some(strength)) = (&params.reference_image, params.effective_strength()) {
        payload.insert("reference_image".to_string(), json!(BASE64.encode(bytes)));
        payload.insert("strength".to_string(), json!(strength));
    }
    Value::Object(payload)
}

fn parse_start_response(
    api_base: &str,
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<StartOutcome, ClientError> {
    if !status.is_success() {
        return Err(ClientError::service(
            status.as_u16(),
            String::from_utf8_lossy(body).to_string(),
        ));
    }
    if content_type
        .map(|value| value.starts_with("image/"))
        .unwrap_or(false)
    {
        return Ok(StartOutcome::Immediate(ResultPayload::Bytes(body.to_vec())));
    }
    let parsed: Value = serde_json::from_slice(body).map_err(|err| {
        ClientError::service(
            status.as_u16(),
            format!("start-generation returned invalid JSON: {err}"),
        )
    })?;
    if let Some(token) = first_string(&parsed, TOKEN_KEYS) {
        return Ok(StartOutcome::Token(SessionToken::new(token)));
    }
    match extract_result_payload(&parsed)? {
        Some(ResultPayload::Url(url)) => Ok(StartOutcome::Immediate(ResultPayload::Url(
            resolve_url(api_base, &url),
        ))),
        Some(payload) => Ok(StartOutcome::Immediate(payload)),
        None => Err(ClientError::service(
            status.as_u16(),
            "start-generation response carried neither a token nor a result",
        )),
    }
}

fn classify_fetch_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> Result<FetchClassification, ClientError> {
    if status == StatusCode::ACCEPTED || status == StatusCode::NOT_FOUND {
        return Ok(FetchClassification::Outcome(FetchOutcome::NotYetReady));
    }
    if !status.is_success() {
        return Err(ClientError::service(
            status.as_u16(),
            String::from_utf8_lossy(&body).to_string(),
        ));
    }
    let is_json = content_type
        .map(|value| value.contains("json"))
        .unwrap_or(false);
    if is_json {
        let parsed: Value = serde_json::from_slice(&body).map_err(|err| {
            ClientError::service(
                status.as_u16(),
                format!("result endpoint returned invalid JSON: {err}"),
            )
        })?;
        return Ok(match extract_result_payload(&parsed)? {
            Some(ResultPayload::Bytes(bytes)) => {
                FetchClassification::Outcome(FetchOutcome::ResultReady(bytes))
            }
            Some(ResultPayload::Url(url)) => FetchClassification::Download(url),
            None => FetchClassification::Outcome(FetchOutcome::NotYetReady),
        });
    }
    if body.is_empty() {
        return Ok(FetchClassification::Outcome(FetchOutcome::NotYetReady));
    }
    Ok(FetchClassification::Outcome(FetchOutcome::ResultReady(body)))
}

fn extract_result_payload(value: &Value) -> Result<Option<ResultPayload>, ClientError> {
    if let Some(url) = first_string(value, URL_KEYS) {
        return Ok(Some(ResultPayload::Url(url)));
    }
    let Some(inline) = first_string(value, INLINE_IMAGE_KEYS) else {
        return Ok(None);
    };
    let encoded = match inline.split_once(";base64,") {
        Some((_, data)) => data,
        None => inline.as_str(),
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| ClientError::service(200, format!("inline image is not base64: {err}")))?;
    Ok(Some(ResultPayload::Bytes(bytes)))
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    })
}

/// `{api_base}/{path}/{token}` with the token encoded as a single path segment.
fn token_url(api_base: &str, path: &str, token: &SessionToken) -> Result<String, ClientError> {
    let mut url = Url::parse(api_base)
        .map_err(|err| ClientError::network(format!("invalid service base URL {api_base}: {err}")))?;
    {
        let mut segments = url.path_segments_mut().map_err(|()| {
            ClientError::network(format!("service base URL {api_base} cannot carry a path"))
        })?;
        segments.pop_if_empty();
        segments.extend(path.split('/').filter(|segment| !segment.is_empty()));
        segments.push(token.as_str());
    }
    Ok(url.to_string())
}

fn resolve_url(api_base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:") {
        return url.to_string();
    }
    format!(
        "{}/{}",
        api_base.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

fn json_value_to_form_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn transport_error(context: &str, err: &reqwest::Error) -> ClientError {
    let mut parts = vec![format!("{context}: {err}")];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !parts.iter().any(|existing| existing.ends_with(&text)) {
            parts.push(text);
        }
        source = cause.source();
    }
    ClientError::network(parts.join(" | caused by: "))
}
