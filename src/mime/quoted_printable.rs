//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Sealpost.
//
// Sealpost is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Sealpost is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Sealpost. If not, see <http://www.gnu.org/licenses/>.

use std::borrow::Cow;

/// The longest encoded line `qp_encode` produces, excluding the line ending.
const MAX_ENCODED_LINE: usize = 76;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Decodes quoted-printable encoding, as described by RFC 2045.
///
/// Soft line breaks (DOS or UNIX) are discarded. Anything that is not a valid
/// escape is passed through verbatim, as are 8-bit bytes.
///
/// Returns the decoded text, as well as a possibly non-empty "dangling" tail
/// holding an escape sequence which could not be completed with the data
/// given. The caller should prepend it to the next chunk.
pub fn qp_decode(s: &[u8]) -> (Cow<[u8]>, &[u8]) {
    let Some(first_eq) = memchr::memchr(b'=', s) else {
        return (Cow::Borrowed(s), &[]);
    };

    let mut decoded = Vec::with_capacity(s.len());
    decoded.extend_from_slice(&s[..first_eq]);

    let mut pos = first_eq;
    while pos < s.len() {
        let Some(off) = memchr::memchr(b'=', &s[pos..]) else {
            decoded.extend_from_slice(&s[pos..]);
            break;
        };

        let eq = pos + off;
        decoded.extend_from_slice(&s[pos..eq]);

        let tail = &s[eq + 1..];
        if tail.starts_with(b"\n") {
            pos = eq + 2;
        } else if tail.starts_with(b"\r\n") {
            pos = eq + 3;
        } else if tail.len() < 2 {
            return (Cow::Owned(decoded), &s[eq..]);
        } else if let Some(byte) = hex_pair(tail[0], tail[1]) {
            decoded.push(byte);
            pos = eq + 3;
        } else {
            decoded.push(b'=');
            pos = eq + 1;
        }
    }

    (Cow::Owned(decoded), &[])
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    fn nybble(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    Some(nybble(hi)? << 4 | nybble(lo)?)
}

/// Encodes `data` as quoted-printable text.
///
/// Line breaks (`\n` or `\r\n`) in the input become hard DOS line breaks in
/// the output; everything else, including a `\r` not followed by `\n`, is
/// preserved exactly. Trailing whitespace is escaped and encoded lines never
/// exceed 76 characters.
///
/// The output never contains a literal `=` other than as the start of an
/// escape or soft line break, which makes `=_` safe as a boundary prefix.
pub fn qp_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut lines = data.split(|&b| b'\n' == b).peekable();

    while let Some(line) = lines.next() {
        let has_more = lines.peek().is_some();
        let line = if has_more {
            line.strip_suffix(b"\r").unwrap_or(line)
        } else {
            line
        };

        let mut column = 0;
        for (ix, &byte) in line.iter().enumerate() {
            let at_end = ix + 1 == line.len();
            let literal = match byte {
                b'=' => false,
                b' ' | b'\t' => !at_end,
                b'!'..=b'~' => true,
                _ => false,
            };
            let width = if literal { 1 } else { 3 };

            // Leave room for the `=` of a soft break
            if column + width > MAX_ENCODED_LINE - 1 {
                out.extend_from_slice(b"=\r\n");
                column = 0;
            }

            if literal {
                out.push(byte);
            } else {
                out.push(b'=');
                out.push(HEX[usize::from(byte >> 4)]);
                out.push(HEX[usize::from(byte & 0xF)]);
            }
            column += width;
        }

        if has_more {
            out.extend_from_slice(b"\r\n");
        }
    }

    out
}
