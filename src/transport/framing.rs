//! TCP ストリームを SIP メッセージ単位に切り出す。
//!
//! 区切りは空行 (`\r\n\r\n`、素の `\n\n` も許容) と `Content-Length`。
//! メッセージ間の CRLF (RFC 5626 keep-alive) は読み捨てる。

use anyhow::{bail, Result};

pub struct FrameBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Appends received bytes. Fails once the pending data outgrows `max_len`,
    /// after which the stream cannot be framed any more.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.max_len {
            bail!(
                "stream buffer overflow ({} bytes pending, limit {})",
                self.buf.len(),
                self.max_len
            );
        }
        Ok(())
    }

    /// Next complete message, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let skip = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if skip > 0 {
            self.buf.drain(..skip);
        }

        let header_len = find_header_end(&self.buf)?;
        let content_len = parse_content_length(&self.buf[..header_len]).unwrap_or(0);
        let total_len = header_len.saturating_add(content_len);
        if self.buf.len() < total_len {
            return None;
        }
        Some(self.buf.drain(..total_len).collect())
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// ヘッダ部の長さ (区切りの空行を含む)
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn parse_content_length(header_bytes: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header_bytes).ok()?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse::<usize>().ok();
        }
    }
    Some(0)
}
