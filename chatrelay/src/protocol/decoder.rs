//! Incremental splitting of a byte stream into text lines.

/// Buffers bytes across reads and yields complete lines.
///
/// Splitting happens on raw `\n` bytes before UTF-8 decoding. A newline byte
/// never occurs inside a multi-byte sequence, so a character cut in half by a
/// read boundary stays buffered until the rest of it arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched and known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of bytes and take every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        lines
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buffer).into_owned())
        }
    }
}
