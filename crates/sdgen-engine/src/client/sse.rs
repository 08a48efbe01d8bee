use sdgen_contracts::errors::ClientError;
use sdgen_contracts::generation::ProgressEvent;

const COMPLETION_MARKERS: &[&str] = &["image", "done", "completed", "complete", "[done]"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            event: "message".to_string(),
            data: String::new(),
            id: None,
        }
    }
}

impl SseEvent {
    /// `None` for keep-alives and malformed numbers.
    pub fn to_progress(&self) -> Option<Result<ProgressEvent, ClientError>> {
        let data = self.data.trim();
        if self.event.eq_ignore_ascii_case("error") {
            let detail = if data.is_empty() {
                "service aborted the progress stream".to_string()
            } else {
                data.to_string()
            };
            return Some(Err(ClientError::service(500, detail)));
        }
        if data.is_empty() {
            return None;
        }
        let lowered = data.to_ascii_lowercase();
        if self.event.eq_ignore_ascii_case("complete")
            || self.event.eq_ignore_ascii_case("completed")
            || COMPLETION_MARKERS.contains(&lowered.as_str())
        {
            return Some(Ok(ProgressEvent::Completed));
        }
        let fraction = data.parse::<f64>().ok().filter(|value| value.is_finite())?;
        Some(Ok(ProgressEvent::Progress(fraction)))
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    utf8_tail: Vec<u8>,
    current: SseEvent,
    has_data: bool,
    bom_checked: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of a UTF-8 sequence split across reads are held until the rest arrives.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);
        let complete = complete_utf8_len(&bytes);
        self.utf8_tail = bytes.split_off(complete);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.feed(&text)
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        if !self.bom_checked && !self.buffer.is_empty() {
            self.bom_checked = true;
            if let Some(stripped) = self.buffer.strip_prefix('\u{FEFF}') {
                self.buffer = stripped.to_string();
            }
        }

        let mut events = Vec::new();
        let mut start = 0usize;
        loop {
            let rest = &self.buffer[start..];
            let Some(rel) = rest.find(&['\r', '\n'][..]) else {
                break;
            };
            let pos = start + rel;
            let bytes = self.buffer.as_bytes();
            let next_start = if bytes[pos] == b'\r' {
                if pos + 1 >= bytes.len() {
                    // A trailing CR may be the first half of CRLF.
                    break;
                }
                if bytes[pos + 1] == b'\n' {
                    pos + 2
                } else {
                    pos + 1
                }
            } else {
                pos + 1
            };
            let line = self.buffer[start..pos].to_string();
            start = next_start;

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else {
                self.process_line(&line);
            }
        }
        self.buffer.drain(..start);
        events
    }

    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            self.current = SseEvent::default();
            return None;
        }
        let mut event = std::mem::take(&mut self.current);
        if event.data.ends_with('\n') {
            event.data.pop();
        }
        if event.event.is_empty() {
            event.event = "message".to_string();
        }
        self.has_data = false;
        Some(event)
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = value.to_string(),
            "data" => {
                self.current.data.push_str(value);
                self.current.data.push('\n');
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.current.id = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Length of `bytes` minus a trailing, still incomplete UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let mut cursor = 0usize;
    loop {
        match std::str::from_utf8(&bytes[cursor..]) {
            Ok(_) => return bytes.len(),
            Err(err) => match err.error_len() {
                Some(invalid) => cursor += err.valid_up_to() + invalid,
                None => return cursor + err.valid_up_to(),
            },
        }
    }
}
