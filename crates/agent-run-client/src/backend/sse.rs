//! Incremental `text/event-stream` decoding down to event `data` payloads.
//!
//! Run streams only carry `data:` lines, so event names, ids and retry hints
//! are skipped rather than surfaced.

/// Splits raw body chunks into lines and yields the joined `data` of each
/// event once its terminating blank line arrives.
#[derive(Default)]
pub(crate) struct EventDataDecoder {
    pending_line: Vec<u8>,
    data_lines: Vec<String>,
}

impl EventDataDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.pending_line.push(byte);
                continue;
            }
            let line = std::mem::take(&mut self.pending_line);
            if let Some(payload) = self.accept_line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flushes an event the server did not terminate with a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.pending_line);
        if !line.is_empty() {
            self.accept_line(&line);
        }
        self.dispatch()
    }

    fn accept_line(&mut self, raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return self.dispatch();
        }
        let line = String::from_utf8_lossy(raw);
        if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data_lines).join("\n"))
    }
}
