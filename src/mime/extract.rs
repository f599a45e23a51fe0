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

//! Extraction of the displayable body and attachments of a MIME tree.
//!
//! The first text part becomes the body. If it sits in a
//! `multipart/alternative`, its HTML or plain sibling in that same group is
//! kept too. Any text type other than HTML counts as plain. Everything else
//! becomes an attachment, decoded from its transfer encoding but otherwise
//! byte-exact.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::mem;
use std::rc::Rc;

use super::content_encoding::{CharsetMode, ContentDecoder};
use super::grovel::{GrovelWriter, Visitor};
use super::header::{self, ContentDisposition, ContentType};
use crate::support::system_config::ParserConfig;

#[derive(Clone, Copy, Debug)]
pub struct ExtractOptions {
    /// Use the full charset converter instead of the Latin-1 fallback.
    pub convert_charsets: bool,
    /// Lines longer than this are reported as an anomaly.
    pub max_line_length: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::from(&ParserConfig::default())
    }
}

impl From<&ParserConfig> for ExtractOptions {
    fn from(config: &ParserConfig) -> Self {
        ExtractOptions {
            convert_charsets: config.convert_charsets,
            max_line_length: config.max_line_length,
        }
    }
}

impl ExtractOptions {
    pub fn charset_mode(&self) -> CharsetMode {
        if self.convert_charsets {
            CharsetMode::Convert
        } else {
            CharsetMode::Latin1Fallback
        }
    }
}

/// A text body, converted to UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextBody {
    pub text: String,
    /// The charset the part was declared in.
    pub charset: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedAttachment {
    pub display_name: String,
    pub content_id: Option<String>,
    /// `type/subtype`, lower case.
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extracted {
    pub body: Option<TextBody>,
    pub html_body: Option<TextBody>,
    pub attachments: Vec<ExtractedAttachment>,
    /// The first structural problem found, if any.
    pub anomaly: Option<String>,
}

/// Streams a MIME tree into an `Extracted`.
///
/// This is an `io::Write` so that decrypted content can be extracted as the
/// engine produces it.
pub struct ExtractWriter {
    writer: GrovelWriter<()>,
    shared: Rc<RefCell<Extracted>>,
}

impl ExtractWriter {
    pub fn new(options: ExtractOptions) -> Self {
        let shared = Rc::new(RefCell::new(Extracted::default()));
        let root = PartExtractor::new(
            Rc::clone(&shared),
            Rc::new(RefCell::new(Claims::default())),
            options.charset_mode(),
            None,
        );

        ExtractWriter {
            writer: GrovelWriter::new(
                ContentDecoder::new(Box::new(root), options.charset_mode()),
                options.max_line_length,
            ),
            shared,
        }
    }

    pub fn finish(self) -> Extracted {
        self.writer.finish();
        mem::take(&mut *self.shared.borrow_mut())
    }
}

impl Write for ExtractWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Extract the body and attachments of the MIME tree in `reader`.
pub fn extract(
    mut reader: impl Read,
    options: ExtractOptions,
) -> io::Result<Extracted> {
    let mut writer = ExtractWriter::new(options);
    io::copy(&mut reader, &mut writer)?;
    Ok(writer.finish())
}

/// Which body slots have been taken, and how many parts have been named.
#[derive(Debug, Default)]
struct Claims {
    /// The alternative group of the first text part, once it is seen.
    /// `Some(None)` if that part was not inside an alternative.
    body_group: Option<Option<u32>>,
    plain: bool,
    html: bool,
    alternatives: u32,
    unnamed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Undecided,
    /// `group` identifies a `multipart/alternative`.
    Container { group: Option<u32> },
    Body,
    HtmlBody,
    Attachment,
}

#[derive(Debug)]
struct PartExtractor {
    shared: Rc<RefCell<Extracted>>,
    claims: Rc<RefCell<Claims>>,
    mode: CharsetMode,
    group: Option<u32>,

    role: Role,
    content_type: Option<ContentType<'static>>,
    disposition: Option<ContentDisposition<'static>>,
    content_id: Option<String>,
    data: Vec<u8>,
}

impl PartExtractor {
    fn new(
        shared: Rc<RefCell<Extracted>>,
        claims: Rc<RefCell<Claims>>,
        mode: CharsetMode,
        group: Option<u32>,
    ) -> Self {
        PartExtractor {
            shared,
            claims,
            mode,
            group,
            role: Role::Undecided,
            content_type: None,
            disposition: None,
            content_id: None,
            data: Vec::new(),
        }
    }

    fn decide_role(&mut self) -> Role {
        let Some(ref ct) = self.content_type else {
            return Role::Attachment;
        };

        if ct.is_type("multipart") {
            let group = ct.is_subtype("alternative").then(|| {
                let mut claims = self.claims.borrow_mut();
                claims.alternatives += 1;
                claims.alternatives
            });
            return Role::Container { group };
        }

        if self
            .disposition
            .as_ref()
            .is_some_and(ContentDisposition::is_attachment)
        {
            return Role::Attachment;
        }

        if !ct.is_type("text") {
            return Role::Attachment;
        }

        let mut claims = self.claims.borrow_mut();
        let eligible = match claims.body_group {
            None => true,
            Some(group) => group.is_some() && group == self.group,
        };
        if !eligible {
            return Role::Attachment;
        }

        let role = if ct.is_subtype("html") {
            if mem::replace(&mut claims.html, true) {
                return Role::Attachment;
            }
            Role::HtmlBody
        } else {
            if mem::replace(&mut claims.plain, true) {
                return Role::Attachment;
            }
            Role::Body
        };
        claims.body_group = Some(self.group);
        role
    }

    fn charset(&self) -> String {
        self.content_type
            .as_ref()
            .and_then(|ct| ct.parm("charset"))
            .map(|cs| String::from_utf8_lossy(cs).to_ascii_lowercase())
            .unwrap_or_else(|| "us-ascii".to_owned())
    }

    fn text_body(&mut self) -> TextBody {
        let data = mem::take(&mut self.data);
        TextBody {
            text: String::from_utf8(data).unwrap_or_else(|e| {
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }),
            charset: self.charset(),
        }
    }

    fn attachment(&mut self) -> ExtractedAttachment {
        let (content_type, extension) = match self.content_type {
            Some(ref ct) => (
                format!(
                    "{}/{}",
                    String::from_utf8_lossy(&ct.typ),
                    String::from_utf8_lossy(&ct.subtype),
                )
                .to_ascii_lowercase(),
                if ct.is("message", "rfc822") {
                    "eml"
                } else {
                    "dat"
                },
            ),
            None => ("application/octet-stream".to_owned(), "dat"),
        };

        let display_name = self
            .disposition
            .as_ref()
            .and_then(ContentDisposition::filename)
            .or_else(|| {
                self.content_type.as_ref().and_then(header::content_type_name)
            })
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                let mut claims = self.claims.borrow_mut();
                claims.unnamed += 1;
                format!("unnamed-{}.{}", claims.unnamed, extension)
            });

        ExtractedAttachment {
            display_name,
            content_id: self.content_id.take(),
            content_type,
            data: mem::take(&mut self.data),
        }
    }
}

impl Visitor for PartExtractor {
    type Output = ();

    fn header(
        &mut self,
        _raw: &[u8],
        name: &str,
        value: &[u8],
    ) -> Result<(), ()> {
        if name.eq_ignore_ascii_case("Content-Disposition") {
            self.disposition = header::parse_content_disposition(value)
                .map(ContentDisposition::into_owned);
        } else if name.eq_ignore_ascii_case("Content-ID") {
            self.content_id = header::parse_content_id(value);
        }

        Ok(())
    }

    fn content_type(&mut self, ct: &ContentType<'_>) -> Result<(), ()> {
        self.content_type = Some(ct.clone().into_owned());
        Ok(())
    }

    fn start_content(&mut self) -> Result<(), ()> {
        self.role = self.decide_role();
        Ok(())
    }

    fn wants_charset_decoding(&self) -> bool {
        matches!(self.role, Role::Body | Role::HtmlBody)
    }

    fn content(&mut self, data: &[u8]) -> Result<(), ()> {
        if !matches!(self.role, Role::Container { .. }) {
            self.data.extend_from_slice(data);
        }
        Ok(())
    }

    fn start_part(&mut self) -> Option<Box<dyn Visitor<Output = ()>>> {
        let Role::Container { group } = self.role else {
            // message/rfc822 is kept whole as an attachment
            return None;
        };

        let child = PartExtractor::new(
            Rc::clone(&self.shared),
            Rc::clone(&self.claims),
            self.mode,
            group,
        );
        Some(Box::new(ContentDecoder::new(Box::new(child), self.mode)))
    }

    fn anomaly(&mut self, description: &str) -> Result<(), ()> {
        let mut shared = self.shared.borrow_mut();
        if shared.anomaly.is_none() {
            shared.anomaly = Some(description.to_owned());
        }
        Ok(())
    }

    fn end(&mut self) {
        match self.role {
            Role::Undecided | Role::Container { .. } => (),
            Role::Body => {
                let body = self.text_body();
                self.shared.borrow_mut().body = Some(body);
            },
            Role::HtmlBody => {
                let body = self.text_body();
                self.shared.borrow_mut().html_body = Some(body);
            },
            Role::Attachment => {
                let attachment = self.attachment();
                self.shared.borrow_mut().attachments.push(attachment);
            },
        }
    }
}

#[cfg(test)]
mod test {
    use base64::Engine;

    use super::*;

    fn extract_str(message: &str) -> Extracted {
        extract(message.as_bytes(), ExtractOptions::default()).unwrap()
    }

    fn extract_chunked(message: &[u8], chunk_size: usize) -> Extracted {
        let mut writer = ExtractWriter::new(ExtractOptions::default());
        for chunk in message.chunks(chunk_size) {
            writer.write_all(chunk).unwrap();
        }
        writer.finish()
    }

    #[test]
    fn simple_text_message() {
        let extracted = extract_str(
            "Subject: hello\r\n\
             Content-Type: text/plain; charset=ISO-8859-1\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\
             \r\n\
             Gr=FC=DFe\r\n",
        );
        assert_eq!(
            Some(TextBody {
                text: "Grüße\r\n".to_owned(),
                charset: "iso-8859-1".to_owned(),
            }),
            extracted.body
        );
        assert_eq!(None, extracted.html_body);
        assert!(extracted.attachments.is_empty());
        assert_eq!(None, extracted.anomaly);
    }

    #[test]
    fn latin1_fallback() {
        let extracted = extract(
            &b"Content-Type: text/plain; charset=windows-1252\r\n\r\n\x80uro\r\n"[..],
            ExtractOptions {
                convert_charsets: false,
                ..ExtractOptions::default()
            },
        )
        .unwrap();
        assert_eq!("\u{80}uro\r\n", extracted.body.unwrap().text);
    }

    static ALTERNATIVE_WITH_ATTACHMENTS: &str =
        "Content-Type: multipart/mixed; boundary=outer\r\n\
         \r\n\
         --outer\r\n\
         Content-Type: multipart/alternative; boundary=inner\r\n\
         \r\n\
         --inner\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         plain body\r\n\
         --inner\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         \r\n\
         <html><body>html body</body></html>\r\n\
         --inner--\r\n\
         --outer\r\n\
         Content-Type: text/plain; name=\"notes.txt\"\r\n\
         \r\n\
         second text part\r\n\
         --outer\r\n\
         Content-Type: image/png\r\n\
         Content-Transfer-Encoding: base64\r\n\
         Content-ID: <logo@example.org>\r\n\
         \r\n\
         iVBORw0KGgo=\r\n\
         --outer\r\n\
         Content-Type: text/html\r\n\
         Content-Disposition: attachment;\r\n \
         filename*=utf-8''r%C3%A9sum%C3%A9.html\r\n\
         \r\n\
         <p>cv</p>\r\n\
         --outer--\r\n";

    #[test]
    fn alternative_with_attachments() {
        let extracted = extract_str(ALTERNATIVE_WITH_ATTACHMENTS);

        assert_eq!("plain body", extracted.body.unwrap().text);
        assert_eq!(
            "<html><body>html body</body></html>",
            extracted.html_body.unwrap().text
        );

        assert_eq!(
            vec![
                ExtractedAttachment {
                    display_name: "notes.txt".to_owned(),
                    content_id: None,
                    content_type: "text/plain".to_owned(),
                    data: b"second text part".to_vec(),
                },
                ExtractedAttachment {
                    display_name: "unnamed-1.dat".to_owned(),
                    content_id: Some("logo@example.org".to_owned()),
                    content_type: "image/png".to_owned(),
                    data: b"\x89PNG\r\n\x1a\n".to_vec(),
                },
                ExtractedAttachment {
                    display_name: "résumé.html".to_owned(),
                    content_id: None,
                    content_type: "text/html".to_owned(),
                    data: b"<p>cv</p>".to_vec(),
                },
            ],
            extracted.attachments
        );
    }

    #[test]
    fn first_text_part_wins_outside_alternative() {
        let extracted = extract_str(
            "Content-Type: multipart/mixed; boundary=b\r\n\
             \r\n\
             --b\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <b>first</b>\r\n\
             --b\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             second\r\n\
             --b--\r\n",
        );
        assert_eq!(None, extracted.body);
        assert_eq!("<b>first</b>", extracted.html_body.unwrap().text);
        assert_eq!(1, extracted.attachments.len());
        assert_eq!("unnamed-1.dat", extracted.attachments[0].display_name);
    }

    #[test]
    fn later_alternative_does_not_replace_body() {
        let extracted = extract_str(
            "Content-Type: multipart/mixed; boundary=outer\r\n\
             \r\n\
             --outer\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             FIRST BODY\r\n\
             --outer\r\n\
             Content-Type: multipart/alternative; boundary=inner\r\n\
             \r\n\
             --inner\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             later plain\r\n\
             --inner\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <p>LATER HTML</p>\r\n\
             --inner--\r\n\
             --outer--\r\n",
        );
        assert_eq!("FIRST BODY", extracted.body.unwrap().text);
        assert_eq!(None, extracted.html_body);
        assert_eq!(
            vec!["text/plain", "text/html"],
            extracted
                .attachments
                .iter()
                .map(|a| a.content_type.as_str())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn second_alternative_group_is_not_merged() {
        let extracted = extract_str(
            "Content-Type: multipart/mixed; boundary=outer\r\n\
             \r\n\
             --outer\r\n\
             Content-Type: multipart/alternative; boundary=one\r\n\
             \r\n\
             --one\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             plain only\r\n\
             --one--\r\n\
             --outer\r\n\
             Content-Type: multipart/alternative; boundary=two\r\n\
             \r\n\
             --two\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <p>other</p>\r\n\
             --two--\r\n\
             --outer--\r\n",
        );
        assert_eq!("plain only", extracted.body.unwrap().text);
        assert_eq!(None, extracted.html_body);
        assert_eq!(1, extracted.attachments.len());
    }

    #[test]
    fn any_text_type_can_be_the_body() {
        let extracted = extract_str(
            "Content-Type: multipart/mixed; boundary=b\r\n\
             \r\n\
             --b\r\n\
             Content-Type: text/enriched; charset=us-ascii\r\n\
             \r\n\
             <bold>hi</bold>\r\n\
             --b\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             second\r\n\
             --b--\r\n",
        );
        let body = extracted.body.unwrap();
        assert_eq!("<bold>hi</bold>", body.text);
        assert_eq!("us-ascii", body.charset);
        assert_eq!(None, extracted.html_body);
        assert_eq!(1, extracted.attachments.len());
    }

    #[test]
    fn attachments_are_not_charset_converted() {
        let extracted = extract(
            &b"Content-Type: multipart/mixed; boundary=b\r\n\
               \r\n\
               --b\r\n\
               \r\n\
               body\r\n\
               --b\r\n\
               Content-Type: text/plain; charset=iso-8859-1\r\n\
               Content-Disposition: attachment; filename=raw.txt\r\n\
               \r\n\
               caf\xe9\r\n\
               --b--\r\n"[..],
            ExtractOptions::default(),
        )
        .unwrap();
        assert_eq!("body", extracted.body.unwrap().text);
        assert_eq!(b"caf\xe9".to_vec(), extracted.attachments[0].data);
    }

    #[test]
    fn nested_message_is_one_attachment() {
        let extracted = extract_str(
            "Content-Type: multipart/mixed; boundary=b\r\n\
             \r\n\
             --b\r\n\
             \r\n\
             see attached\r\n\
             --b\r\n\
             Content-Type: message/rfc822\r\n\
             \r\n\
             Subject: inner\r\n\
             \r\n\
             inner body\r\n\
             --b--\r\n",
        );
        assert_eq!("see attached", extracted.body.unwrap().text);
        assert_eq!(1, extracted.attachments.len());
        assert_eq!("unnamed-1.eml", extracted.attachments[0].display_name);
        assert_eq!(
            b"Subject: inner\r\n\r\ninner body".to_vec(),
            extracted.attachments[0].data
        );
    }

    #[test]
    fn base64_attachment_split_across_buffers() {
        let payload = (0..=255u8).cycle().take(3000).collect::<Vec<u8>>();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);
        let mut message = b"Content-Type: multipart/mixed; boundary=zz\r\n\
                            \r\n\
                            --zz\r\n\
                            \r\n\
                            see attachment\r\n\
                            --zz\r\n\
                            Content-Type: application/octet-stream\r\n\
                            Content-Transfer-Encoding: base64\r\n\
                            \r\n"
            .to_vec();
        for line in encoded.as_bytes().chunks(76) {
            message.extend_from_slice(line);
            message.extend_from_slice(b"\r\n");
        }
        message.extend_from_slice(b"--zz--\r\n");

        let whole = extract_chunked(&message, message.len());
        assert_eq!(payload, whole.attachments[0].data);
        for chunk_size in [1, 2, 3, 5, 7, 13, 4097] {
            assert_eq!(
                whole,
                extract_chunked(&message, chunk_size),
                "chunk size {}",
                chunk_size
            );
        }
    }

    #[test]
    fn long_lines_are_anomalies() {
        let mut message = b"Content-Type: text/plain\r\n\r\n".to_vec();
        message.extend(std::iter::repeat(b'a').take(500));
        message.extend_from_slice(b"\r\n");

        let extracted = extract(
            &message[..],
            ExtractOptions {
                convert_charsets: true,
                max_line_length: 100,
            },
        )
        .unwrap();
        assert_eq!(Some("line too long".to_owned()), extracted.anomaly);
        assert_eq!(502, extracted.body.unwrap().text.len());
    }
}
