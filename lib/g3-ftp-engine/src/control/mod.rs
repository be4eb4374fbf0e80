/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use crate::config::ControlCharset;

mod line;
mod response;

pub use line::LineFramer;
pub use response::{FtpReply, ResponseAssembler};

/// Encode a command line for the wire, appending CRLF.
///
/// Commands go out in the charset replies are decoded with: UTF-8 only once
/// negotiated, the 8-bit fallback otherwise. In the fallback, characters
/// above U+00FF are replaced since the server cannot represent them anyway.
pub(crate) fn encode_command(charset: ControlCharset, cmd: &str) -> Vec<u8> {
    let mut buf = match charset {
        ControlCharset::Utf8 => cmd.as_bytes().to_vec(),
        // 8-bit fallback until OPTS UTF8 has gone through
        ControlCharset::Auto | ControlCharset::Latin1 => {
            let mut buf = Vec::with_capacity(cmd.len() + 2);
            for c in cmd.chars() {
                let cp = c as u32;
                if cp <= 0xFF {
                    buf.push(cp as u8);
                } else {
                    buf.push(b'?');
                }
            }
            buf
        }
    };
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Mask the argument of a command for logging, e.g. `PASS ****`.
pub(crate) fn mask_command_args(cmd: &str) -> String {
    match cmd.find(' ') {
        Some(pos) => {
            let stars = "*".repeat(cmd.len() - pos - 1);
            format!("{}{stars}", &cmd[..=pos])
        }
        None => cmd.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_utf8() {
        assert_eq!(
            encode_command(ControlCharset::Utf8, "CWD /höme"),
            "CWD /höme\r\n".as_bytes()
        );
    }

    #[test]
    fn encode_latin1() {
        let buf = encode_command(ControlCharset::Latin1, "CWD /höme");
        assert_eq!(buf, b"CWD /h\xf6me\r\n");
        let buf = encode_command(ControlCharset::Latin1, "CWD /家");
        assert_eq!(buf, b"CWD /?\r\n");
    }

    #[test]
    fn encode_auto_matches_fallback_before_negotiation() {
        // what came in as Latin-1 must go back out as Latin-1
        let buf = encode_command(ControlCharset::Auto, "CWD /höme");
        assert_eq!(buf, b"CWD /h\xf6me\r\n");
    }

    #[test]
    fn mask_args() {
        assert_eq!(mask_command_args("PASS secret"), "PASS ******");
        assert_eq!(mask_command_args("NOOP"), "NOOP");
    }
}
