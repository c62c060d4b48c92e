/// Per-stream byte accumulator that yields complete lines.
///
/// Bytes are kept undecoded until a newline arrives so that a chunk boundary
/// falling inside a multi-byte UTF-8 sequence does not corrupt the line.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk and returns every line it completed, without the
    /// trailing `\n` (or `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..last_newline]
            .split(|byte| *byte == b'\n')
            .map(decode_line)
            .collect()
    }

    /// The incomplete trailing fragment, decoded lossily.
    pub fn fragment(&self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(decode_line(&self.pending))
        }
    }

    /// Drains the trailing fragment at end of stream.
    pub fn take_remainder(&mut self) -> Option<String> {
        let remainder = self.fragment();
        self.pending.clear();
        remainder
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
