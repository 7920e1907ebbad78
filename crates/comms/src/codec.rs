// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Line framing for the Rapic ASCII stream.

use crate::error::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_LINE: usize = 1023;

const EOT: u8 = 0x04;
const ETX: u8 = 0x03;
const SUB: u8 = 0x1a;

fn is_terminator(b: u8) -> bool {
    matches!(b, b'\r' | b'\n' | b'#' | SUB | ETX | EOT | 0)
}

/// Splits an inbound byte stream into lines. Leading whitespace and control bytes are
/// dropped, and an over-long line is cut at `max_len`.
#[derive(Debug)]
pub struct RapicLineCodec {
    max_len: usize,
    line: Vec<u8>,
}

impl Default for RapicLineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE)
    }
}

impl RapicLineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            line: Vec::with_capacity(128),
        }
    }

    /// Discards any partial line, e.g. after a disconnect.
    pub fn reset(&mut self) {
        self.line.clear();
    }

    fn take_line(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        s
    }
}

impl Decoder for RapicLineCodec {
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let b = src.get_u8();
            if is_terminator(b) {
                if !self.line.is_empty() {
                    return Ok(Some(self.take_line()));
                }
                continue;
            }
            if self.line.is_empty() && (b.is_ascii_whitespace() || b.is_ascii_control()) {
                continue;
            }
            self.line.push(b);
            if self.line.len() >= self.max_len {
                return Ok(Some(self.take_line()));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if self.line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.take_line()))
        }
    }
}

impl Encoder<&str> for RapicLineCodec {
    type Error = TransportError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

/// Some transmitters emit a status message without a preceding line break, so it lands
/// on the tail of a radial. Splits such a line into the radial and the message.
pub fn split_embedded_status(line: &str) -> (&str, Option<&str>) {
    if !(line.starts_with('%') || line.starts_with('@')) {
        return (line, None);
    }
    let pos = [line.find("MSSG:"), line.find("END STATUS")]
        .into_iter()
        .flatten()
        .min();
    match pos {
        Some(p) if p > 0 => (&line[..p], Some(&line[p..])),
        _ => (line, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut RapicLineCodec, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut out = vec![];
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn terminators_split_lines() {
        let mut codec = RapicLineCodec::default();
        let lines = decode_all(
            &mut codec,
            b"STNID: 3\r\nDATE: 03224\x04TIME: 12.30#\x00\x1aEND RADAR IMAGE\x03",
        );
        assert_eq!(
            lines,
            vec!["STNID: 3", "DATE: 03224", "TIME: 12.30", "END RADAR IMAGE"]
        );
    }

    #[test]
    fn partial_lines_carry_over() {
        let mut codec = RapicLineCodec::default();
        assert!(decode_all(&mut codec, b"  \t MSSG: 3").is_empty());
        assert_eq!(decode_all(&mut codec, b"0 ok\n"), vec!["MSSG: 30 ok"]);
    }

    #[test]
    fn overlong_line_is_cut() {
        let mut codec = RapicLineCodec::new(4);
        assert_eq!(decode_all(&mut codec, b"abcdefg\n"), vec!["abcd", "efg"]);
    }

    #[test]
    fn eof_flushes_remainder() {
        let mut codec = RapicLineCodec::default();
        let mut buf = BytesMut::from(&b"tail"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("tail".to_string()));
    }

    #[test]
    fn embedded_status() {
        assert_eq!(
            split_embedded_status("%123abcMSSG: 30 hello"),
            ("%123abc", Some("MSSG: 30 hello"))
        );
        assert_eq!(split_embedded_status("MSSG: 30 x"), ("MSSG: 30 x", None));
        assert_eq!(split_embedded_status("%123abc"), ("%123abc", None));
    }
}
