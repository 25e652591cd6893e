//! Reassembly of `event:` / `data:` frames from arbitrarily split chunks.

/// Payloads that signal total completion without carrying JSON.
const DONE_SENTINELS: [&str; 2] = ["[DONE]", "DONE"];

/// One complete frame of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the last `event: ` line, if any.
    pub event: Option<String>,
    /// All `data: ` fragments concatenated without a separator.
    pub data: String,
}

impl SseFrame {
    /// Returns true when the payload is the literal completion sentinel.
    pub fn is_done_sentinel(&self) -> bool {
        DONE_SENTINELS.contains(&self.data.as_str())
    }
}

/// Incremental frame decoder.
///
/// Bytes are buffered until a blank line closes a frame, so chunk boundaries
/// may fall anywhere, including inside a multi-byte UTF-8 sequence.
#[derive(Default, Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every frame completed by it.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk.as_ref());
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return None;
    }
    let mut event: Option<String> = None;
    let mut data = String::new();
    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if let Some(rest) = line.strip_prefix("event: ") {
            event = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data.push_str(rest);
        }
    }
    if data.trim().is_empty() {
        return None;
    }
    Some(SseFrame { event, data })
}
