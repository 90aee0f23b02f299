//! Incremental Server-Sent Events decoder
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::feed`] buffers partial
//! lines and returns every event completed by the chunk. Lines end with LF,
//! CRLF or a bare CR.

/// Largest event accepted, data and field lines included
pub const MAX_SSE_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Event name used when the server sends none
pub const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    /// Last event ID seen on the stream at dispatch time
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Event(SseEvent),
    /// An event exceeded the size limit and was discarded
    Oversized { size: usize },
}

#[derive(Debug)]
pub struct SseDecoder {
    max_size: usize,
    line: Vec<u8>,
    line_len: usize,
    /// The previous byte was a CR, so a following LF belongs to it
    after_cr: bool,
    event_type: String,
    data: String,
    has_data: bool,
    event_size: usize,
    overflow: bool,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(MAX_SSE_MESSAGE_SIZE)
    }
}

impl SseDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            line: Vec::new(),
            line_len: 0,
            after_cr: false,
            event_type: String::new(),
            data: String::new(),
            has_data: false,
            event_size: 0,
            overflow: false,
            last_event_id: None,
            retry_ms: None,
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay requested by the server
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        let mut out = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::take(&mut self.after_cr);
            match byte {
                b'\n' if after_cr => continue,
                b'\n' => {
                    self.end_line(&mut out);
                    continue;
                }
                b'\r' => {
                    self.end_line(&mut out);
                    self.after_cr = true;
                    continue;
                }
                _ => {}
            }
            self.line_len += 1;
            if self.overflow {
                continue;
            }
            self.line.push(byte);
            if self.event_size + self.line.len() > self.max_size {
                self.overflow = true;
                self.line.clear();
            }
        }
        out
    }

    fn end_line(&mut self, out: &mut Vec<SseItem>) {
        let blank = self.line_len == 0;
        let line_len = self.line_len;
        self.line_len = 0;

        if self.overflow {
            self.event_size += line_len;
            self.line.clear();
            if blank {
                out.push(SseItem::Oversized {
                    size: self.event_size,
                });
                self.reset_event();
            }
            return;
        }

        let line = std::mem::take(&mut self.line);
        if line.is_empty() {
            self.dispatch(out);
            return;
        }

        self.event_size += line.len() + 1;
        self.process_field(&line);
    }

    fn process_field(&mut self, line: &[u8]) {
        if line[0] == b':' {
            return;
        }
        let text = String::from_utf8_lossy(line);
        let (field, value) = match text.find(':') {
            Some(pos) => {
                let value = &text[pos + 1..];
                (&text[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (text.as_ref(), ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, out: &mut Vec<SseItem>) {
        if self.has_data || !self.event_type.is_empty() {
            let event = if self.event_type.is_empty() {
                DEFAULT_EVENT.to_string()
            } else {
                std::mem::take(&mut self.event_type)
            };
            out.push(SseItem::Event(SseEvent {
                event,
                data: std::mem::take(&mut self.data),
                id: self.last_event_id.clone(),
            }));
        }
        self.reset_event();
    }

    fn reset_event(&mut self) {
        self.event_type.clear();
        self.data.clear();
        self.has_data = false;
        self.event_size = 0;
        self.overflow = false;
    }
}
