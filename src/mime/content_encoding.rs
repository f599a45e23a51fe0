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
use std::fmt;

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};

use super::grovel::Visitor;
use super::header::{self, ContentTransferEncoding};
use super::quoted_printable::qp_decode;

/// How text parts in charsets other than UTF-8 are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharsetMode {
    /// Bytes are passed through untouched.
    Raw,
    /// UTF-8 passes through; anything else is taken to be Latin-1 and
    /// expanded byte-for-byte.
    Latin1Fallback,
    /// Declared charsets are converted with a full decoder; unknown labels
    /// fall back to Latin-1.
    Convert,
}

/// Interposer for `Visitor` which decodes content.
///
/// Transfer encoding is always decoded. Text parts are additionally
/// converted to UTF-8 according to the `CharsetMode`, unless the delegate
/// declines through `Visitor::wants_charset_decoding`.
///
/// The first invalid base64 character in a part is reported to the delegate
/// as an anomaly; the character itself is skipped.
#[derive(Debug)]
pub struct ContentDecoder<V: ?Sized> {
    delegate: Box<V>,
    mode: CharsetMode,

    content_transfer_encoding: ContentTransferEncoding,
    is_text: bool,
    charset: Option<Vec<u8>>,

    decoder: Option<DecoderState>,
}

#[derive(Debug)]
struct DecoderState {
    content_transfer_encoding: ContentTransferEncoding,
    base64: Base64Decoder,
    reported_invalid: bool,
    qp_dangling: Vec<u8>,
    charset: CharsetConverter,
    cte_buffer: Vec<u8>,
    charset_buffer: Vec<u8>,
}

enum CharsetConverter {
    Identity,
    Latin1,
    Full(encoding_rs::Decoder),
}

impl fmt::Debug for CharsetConverter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CharsetConverter::Identity => write!(f, "Identity"),
            CharsetConverter::Latin1 => write!(f, "Latin1"),
            CharsetConverter::Full(ref d) => {
                write!(f, "Full({})", d.encoding().name())
            },
        }
    }
}

impl<V: ?Sized> ContentDecoder<V> {
    pub fn new(delegate: Box<V>, mode: CharsetMode) -> Self {
        ContentDecoder {
            delegate,
            mode,

            content_transfer_encoding: ContentTransferEncoding::SevenBit,
            is_text: false,
            charset: None,

            decoder: None,
        }
    }

    pub fn inner_mut(&mut self) -> &mut V {
        &mut self.delegate
    }

    fn charset_converter(&self, wanted: bool) -> CharsetConverter {
        if !wanted || !self.is_text {
            return CharsetConverter::Identity;
        }

        converter_for(self.charset.as_deref(), self.mode)
    }
}

fn converter_for(
    charset: Option<&[u8]>,
    mode: CharsetMode,
) -> CharsetConverter {
    if CharsetMode::Raw == mode {
        return CharsetConverter::Identity;
    }

    let label = charset.unwrap_or(b"us-ascii");
    if label.eq_ignore_ascii_case(b"utf-8")
        || label.eq_ignore_ascii_case(b"utf8")
    {
        return CharsetConverter::Identity;
    }

    if CharsetMode::Convert == mode {
        if let Some(encoding) =
            encoding_rs::Encoding::for_label_no_replacement(label)
        {
            return CharsetConverter::Full(
                encoding.new_decoder_with_bom_removal(),
            );
        }
    }

    CharsetConverter::Latin1
}

/// Convert a complete text declared to be in `charset` to UTF-8, by the same
/// rules that apply to text parts.
pub fn text_to_utf8(data: &[u8], charset: &str, mode: CharsetMode) -> String {
    match converter_for(Some(charset.as_bytes()), mode) {
        CharsetConverter::Identity => {
            String::from_utf8_lossy(data).into_owned()
        },
        CharsetConverter::Latin1 => {
            data.iter().copied().map(char::from).collect()
        },
        CharsetConverter::Full(decoder) => decoder
            .encoding()
            .decode_with_bom_removal(data)
            .0
            .into_owned(),
    }
}

impl<V: Visitor + ?Sized> Visitor for ContentDecoder<V> {
    type Output = V::Output;

    fn raw_line(&mut self, line: &[u8]) -> Result<(), Self::Output> {
        self.delegate.raw_line(line)
    }

    fn header(
        &mut self,
        raw: &[u8],
        name: &str,
        value: &[u8],
    ) -> Result<(), Self::Output> {
        if name.eq_ignore_ascii_case("Content-Transfer-Encoding") {
            self.content_transfer_encoding =
                header::parse_content_transfer_encoding(value)
                    .unwrap_or_default();
        }

        self.delegate.header(raw, name, value)
    }

    fn content_type(
        &mut self,
        ct: &header::ContentType<'_>,
    ) -> Result<(), Self::Output> {
        self.is_text = ct.is_type("text");
        self.charset = ct.parm("charset").map(|c| c.to_vec());
        self.delegate.content_type(ct)
    }

    fn leaf_section(
        &mut self,
    ) -> Option<Box<dyn Visitor<Output = Self::Output>>> {
        self.delegate.leaf_section()
    }

    fn start_content(&mut self) -> Result<(), Self::Output> {
        let result = self.delegate.start_content();

        let charset = self.charset_converter(
            self.delegate.wants_charset_decoding(),
        );
        self.decoder = Some(DecoderState {
            content_transfer_encoding: self.content_transfer_encoding,
            base64: Base64Decoder::default(),
            reported_invalid: false,
            qp_dangling: Vec::new(),
            charset,
            cte_buffer: Vec::new(),
            charset_buffer: Vec::new(),
        });

        result
    }

    fn wants_charset_decoding(&self) -> bool {
        self.delegate.wants_charset_decoding()
    }

    fn content(&mut self, data: &[u8]) -> Result<(), Self::Output> {
        let Some(ref mut decoder) = self.decoder else {
            return self.delegate.content(data);
        };

        let data = decoder.push_content(data);
        if !data.is_empty() {
            self.delegate.content(data)?;
        }

        if decoder.base64.saw_invalid()
            && !std::mem::replace(&mut decoder.reported_invalid, true)
        {
            self.delegate.anomaly("invalid base64 content")?;
        }

        Ok(())
    }

    fn start_part(
        &mut self,
    ) -> Option<Box<dyn Visitor<Output = Self::Output>>> {
        self.delegate.start_part()
    }

    fn child_result(
        &mut self,
        child_result: Self::Output,
    ) -> Result<(), Self::Output> {
        self.delegate.child_result(child_result)
    }

    fn anomaly(&mut self, description: &str) -> Result<(), Self::Output> {
        self.delegate.anomaly(description)
    }

    fn end(&mut self) -> Self::Output {
        if let Some(ref mut decoder) = self.decoder {
            if let Some(data) = decoder.finish() {
                if let Err(out) = self.delegate.content(data) {
                    return out;
                }
            }
        }

        self.delegate.end()
    }
}

impl DecoderState {
    fn push_content<'a, 'b: 'a>(&'b mut self, data: &'a [u8]) -> &'a [u8] {
        use super::header::ContentTransferEncoding as CTE;

        let data = match self.content_transfer_encoding {
            CTE::SevenBit | CTE::EightBit | CTE::Binary => data,
            CTE::Base64 => {
                self.cte_buffer.clear();
                self.base64.decode(data, &mut self.cte_buffer);
                &self.cte_buffer
            },
            CTE::QuotedPrintable => {
                self.decode_qp(data);
                &self.cte_buffer
            },
        };

        match self.charset {
            CharsetConverter::Identity => data,
            CharsetConverter::Latin1 => {
                self.charset_buffer.clear();
                latin1_to_utf8(data, &mut self.charset_buffer);
                &self.charset_buffer
            },
            CharsetConverter::Full(ref mut decoder) => {
                self.charset_buffer.resize(
                    decoder
                        .max_utf8_buffer_length(data.len())
                        .expect("Chunk too large to fit into memory"),
                    0,
                );
                let (_status, _nread, nwritten, _replaced) = decoder
                    .decode_to_utf8(data, &mut self.charset_buffer, false);
                &self.charset_buffer[..nwritten]
            },
        }
    }

    fn decode_qp(&mut self, data: &[u8]) {
        self.cte_buffer.clear();
        self.qp_dangling.extend_from_slice(data);

        let (decoded, dangling) = qp_decode(&self.qp_dangling);
        match decoded {
            Cow::Owned(v) => self.cte_buffer = v,
            Cow::Borrowed(v) => self.cte_buffer.extend_from_slice(v),
        }
        let consumed = self.qp_dangling.len() - dangling.len();
        self.qp_dangling.drain(..consumed);
    }

    fn finish(&mut self) -> Option<&[u8]> {
        // Incomplete escapes or base64 quanta at the very end are garbage
        // with no sensible interpretation, so only the charset decoder gets
        // a say.
        let CharsetConverter::Full(ref mut decoder) = self.charset else {
            return None;
        };

        self.charset_buffer.resize(
            decoder
                .max_utf8_buffer_length(0)
                .expect("End of char conversion too big to fit in memory"),
            0,
        );
        let (_status, _nread, nwritten, _replaced) =
            decoder.decode_to_utf8(&[], &mut self.charset_buffer, true);

        if 0 != nwritten {
            Some(&self.charset_buffer[..nwritten])
        } else {
            None
        }
    }
}

/// Expand Latin-1 bytes to UTF-8.
pub fn latin1_to_utf8(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len());
    for &b in data {
        if b < 0x80 {
            out.push(b);
        } else {
            out.push(0xC0 | (b >> 6));
            out.push(0x80 | (b & 0x3F));
        }
    }
}

/// Lenient engine for decoding mail: padding is optional and stray bits in
/// the final sextet are ignored.
const MAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Streaming base64 decoder.
///
/// Characters of the alphabet are buffered and only complete quanta are
/// handed to the decoder, so input may be split anywhere. Whitespace is
/// ignored. Decoding stops at the first `=`, which also flushes whatever
/// partial quantum precedes it.
#[derive(Clone, Debug, Default)]
pub struct Base64Decoder {
    input_buffer: Vec<u8>,
    stop_seen: bool,
    invalid: bool,
}

impl Base64Decoder {
    pub fn decode(&mut self, data: &[u8], out: &mut Vec<u8>) {
        if self.stop_seen {
            return;
        }

        let mut pushed_any = false;
        for &byte in data {
            match byte {
                b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'+' | b'/' => {
                    self.input_buffer.push(byte);
                    pushed_any = true;
                },
                b'=' => {
                    self.stop_seen = true;
                    break;
                },
                b' ' | b'\t' | b'\r' | b'\n' => (),
                _ => self.invalid = true,
            }
        }

        if self.stop_seen {
            // A lone sextet cannot encode anything
            if 1 == self.input_buffer.len() % 4 {
                self.input_buffer.pop();
                self.invalid = true;
            }
            self.decode_prefix(self.input_buffer.len(), out);
        } else if pushed_any {
            self.decode_prefix(self.input_buffer.len() / 4 * 4, out);
        }
    }

    fn decode_prefix(&mut self, usable_length: usize, out: &mut Vec<u8>) {
        if MAIL_BASE64
            .decode_vec(&self.input_buffer[..usable_length], out)
            .is_err()
        {
            self.invalid = true;
        }

        self.input_buffer.drain(..usable_length);
    }

    /// Whether any character outside the base64 alphabet has been skipped.
    pub fn saw_invalid(&self) -> bool {
        self.invalid
    }

    /// Whether the terminating padding has been reached.
    pub fn is_finished(&self) -> bool {
        self.stop_seen
    }
}
