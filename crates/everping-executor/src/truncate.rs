//! Clipping of pathological output lines.
//!
//! Output is read through [`BoundedLines`], which holds at most
//! [`MAX_LINE_BYTES`] of any one line; a job printing megabytes without a
//! newline costs that much memory and no more. What is kept is then clipped
//! for the run log with middle-omission, which keeps the start of the line
//! and its end.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Longest line written to a run log, in characters.
pub const MAX_LINE_CHARS: usize = 16_384;

/// Most bytes of one output line held in memory while reading.
pub const MAX_LINE_BYTES: usize = 4 * MAX_LINE_CHARS;

/// One line read by [`BoundedLines`], without its newline.
#[derive(Debug, PartialEq, Eq)]
pub struct CappedLine {
    pub bytes: Vec<u8>,
    /// Bytes past the cap, read and thrown away.
    pub dropped: usize,
}

/// Newline-delimited reader with a per-line byte cap.
pub struct BoundedLines<R> {
    reader: BufReader<R>,
    max_bytes: usize,
}

impl<R: AsyncRead + Unpin> BoundedLines<R> {
    pub fn new(reader: R, max_bytes: usize) -> Self {
        Self::with_reader(BufReader::new(reader), max_bytes)
    }

    pub fn with_reader(reader: BufReader<R>, max_bytes: usize) -> Self {
        Self { reader, max_bytes }
    }

    /// Next line, or `None` at end of stream. A final line without a
    /// newline is still returned.
    pub async fn next_line(&mut self) -> std::io::Result<Option<CappedLine>> {
        let mut bytes = Vec::new();
        let mut dropped = 0;
        let mut read_any = false;
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(read_any.then_some(CappedLine { bytes, dropped }));
            }
            read_any = true;
            let newline = buf.iter().position(|&b| b == b'\n');
            let chunk = &buf[..newline.unwrap_or(buf.len())];
            let keep = chunk.len().min(self.max_bytes.saturating_sub(bytes.len()));
            bytes.extend_from_slice(&chunk[..keep]);
            dropped += chunk.len() - keep;
            let consumed = newline.map_or(buf.len(), |i| i + 1);
            self.reader.consume(consumed);
            if newline.is_some() {
                return Ok(Some(CappedLine { bytes, dropped }));
            }
        }
    }
}

/// Clip `line` to at most `max_chars` characters using middle-omission.
///
/// The split is done on character boundaries, so multi-byte sequences are
/// never broken.
pub fn clip_line(line: &str, max_chars: usize) -> String {
    if line.len() <= max_chars {
        return line.to_owned();
    }

    let total = line.chars().count();
    if total <= max_chars {
        return line.to_owned();
    }

    let half = max_chars / 2;
    let head: String = line.chars().take(half).collect();
    let tail: String = line.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head} [... {omitted} chars omitted ...] {tail}")
}
