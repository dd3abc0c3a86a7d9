//! Incremental `text/event-stream` decoding.
//!
//! [`SseParser`] accepts body chunks exactly as they arrive off the wire
//! (chunk boundaries can split lines and even UTF-8 sequences) and yields
//! complete [`SseFrame`]s. [`classify`] then turns a frame into a typed
//! [`StreamEvent`].
//!
//! # Framing
//!
//! - Lines end in `\n`, `\r\n` or `\r`
//! - A blank line dispatches the pending frame (if it has data)
//! - `event:` names the frame, `data:` lines are joined with `\n`
//! - `id:` is remembered across frames, `:` lines are keep-alive comments
//!
//! # Classification
//!
//! The backend wraps pushes in an envelope `{"type": ..., "data": ...}`. The
//! type tag comes from the envelope's `type` field, falling back to the
//! `event:` name and then to `message`. Only envelopes (documents with a
//! `type` field) are unwrapped; bare documents are delivered whole.

use serde_json::Value;

use super::StreamEvent;

/// One dispatched event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
    /// Last event id seen on the stream.
    pub id: Option<String>,
}

/// Stateful event-stream decoder.
#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    skip_lf: bool,
    started: bool,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of body bytes, returning every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut frames),
                b'\r' => {
                    self.end_line(&mut frames);
                    self.skip_lf = true;
                }
                _ => self.line.push(byte),
            }
        }
        frames
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let mut raw = std::mem::take(&mut self.line);
        if !self.started {
            self.started = true;
            if raw.starts_with(&[0xEF, 0xBB, 0xBF]) {
                raw.drain(..3);
            }
        }
        let line = String::from_utf8_lossy(&raw);

        if line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            _ => log::trace!("[Stream] Ignoring field {:?}", field),
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event,
            data,
            id: self.last_id.clone(),
        })
    }
}

/// Turns a frame into a typed stream event.
#[must_use]
pub fn classify(frame: SseFrame) -> StreamEvent {
    let parsed: Option<Value> = serde_json::from_str(&frame.data).ok();

    let envelope_type = parsed
        .as_ref()
        .and_then(|doc| doc.get("type"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_envelope = envelope_type.is_some();

    let tag = envelope_type
        .or(frame.event)
        .unwrap_or_else(|| "message".to_string());

    let payload = match parsed {
        Some(doc) if is_envelope => ["data", "notification"]
            .iter()
            .find_map(|key| doc.get(key).cloned())
            .unwrap_or(doc),
        Some(doc) => doc,
        None => Value::String(frame.data),
    };

    match tag.as_str() {
        "connected" => StreamEvent::Connected(payload),
        "notification" => StreamEvent::Notification(payload),
        "broadcast" => StreamEvent::Broadcast(payload),
        _ => StreamEvent::Message(payload),
    }
}
