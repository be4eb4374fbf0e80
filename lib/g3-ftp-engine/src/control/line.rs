/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use bytes::BytesMut;

use crate::config::ControlCharset;

/// Splits the control-channel byte stream into decoded text lines.
///
/// A line terminator is any of CR, LF or NUL; empty spans between
/// terminators are dropped. A span growing past `max_line_len` without a
/// terminator is truncated and the overflow discarded until the next
/// terminator.
pub struct LineFramer {
    buf: BytesMut,
    max_line_len: usize,
    skipping_overflow: bool,
    charset: ControlCharset,
}

impl LineFramer {
    pub fn new(max_line_len: usize, charset: ControlCharset) -> Self {
        LineFramer {
            buf: BytesMut::with_capacity(max_line_len),
            max_line_len,
            skipping_overflow: false,
            charset,
        }
    }

    /// Switch line decoding to UTF-8 after successful OPTS UTF8 negotiation.
    pub fn set_utf8(&mut self) {
        self.charset = ControlCharset::Utf8;
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self.charset {
            ControlCharset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            // 8-bit fallback until OPTS UTF8 has gone through
            ControlCharset::Auto | ControlCharset::Latin1 => {
                bytes.iter().map(|&b| b as char).collect()
            }
        }
    }

    /// Feed a chunk read from the socket; complete lines are appended to
    /// `out` in arrival order.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<String>) {
        for &b in data {
            if b == b'\r' || b == b'\n' || b == 0 {
                if !self.buf.is_empty() {
                    let line = self.decode(&self.buf);
                    self.buf.clear();
                    out.push(line);
                }
                self.skipping_overflow = false;
            } else if self.skipping_overflow {
                // drop until next terminator
            } else if self.buf.len() >= self.max_line_len {
                self.skipping_overflow = true;
            } else {
                self.buf.extend_from_slice(&[b]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(framer: &mut LineFramer, chunks: &[&[u8]]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            framer.feed(chunk, &mut out);
        }
        out
    }

    #[test]
    fn split_on_all_terminators() {
        let mut framer = LineFramer::new(2048, ControlCharset::Utf8);
        let lines = feed_all(&mut framer, &[b"220 hi\r\n331 user\n\0230 ok\r"]);
        assert_eq!(lines, ["220 hi", "331 user", "230 ok"]);
    }

    #[test]
    fn arbitrary_read_boundaries() {
        let full = b"220-welcome\r\n220 done\r\n";
        for split in 1..full.len() {
            let mut framer = LineFramer::new(2048, ControlCharset::Utf8);
            let lines = feed_all(&mut framer, &[&full[..split], &full[split..]]);
            assert_eq!(lines, ["220-welcome", "220 done"], "split at {split}");
        }
    }

    #[test]
    fn empty_spans_dropped() {
        let mut framer = LineFramer::new(2048, ControlCharset::Utf8);
        let lines = feed_all(&mut framer, &[b"\r\n\r\n200 a\r\n\n\n"]);
        assert_eq!(lines, ["200 a"]);
    }

    #[test]
    fn overlong_line_truncated() {
        let mut framer = LineFramer::new(8, ControlCharset::Utf8);
        let lines = feed_all(&mut framer, &[b"213 too long to fit\r\n200 ok\r\n"]);
        assert_eq!(lines, ["213 too ", "200 ok"]);
    }

    #[test]
    fn latin1_fallback() {
        let mut framer = LineFramer::new(2048, ControlCharset::Latin1);
        let lines = feed_all(&mut framer, &[b"257 \"/h\xf6me\"\r\n"]);
        assert_eq!(lines, ["257 \"/höme\""]);
    }

    #[test]
    fn auto_decodes_latin1_until_promoted() {
        let mut framer = LineFramer::new(2048, ControlCharset::Auto);
        // pre-negotiation high bytes take the 8-bit fallback
        let lines = feed_all(&mut framer, &[b"220 caf\xe9 ftpd\r\n"]);
        assert_eq!(lines, ["220 café ftpd"]);

        framer.set_utf8();
        let lines = feed_all(&mut framer, &[b"257 \"/h\xc3\xb6me\"\r\n"]);
        assert_eq!(lines, ["257 \"/höme\""]);
    }
}
