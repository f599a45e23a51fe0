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

use std::io::Write;

use super::envelope::{generate_boundary, write_base64_lines};
use super::header::{encode_rfc2231, quote};
use super::quoted_printable::qp_encode;
use crate::support::error::Error;

/// An attachment of an outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub filename: String,
    /// `type/subtype`; `application/octet-stream` if empty.
    pub content_type: String,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

/// Serialise `body` and `attachments` as the MIME tree to be protected.
///
/// Without attachments, this is a single `text/plain` part. Otherwise it is
/// a `multipart/mixed` with the body first. Everything is 7-bit clean with
/// CRLF line endings, so the result survives any transport unchanged, which
/// matters since it is what gets signed.
///
/// The body decodes back to exactly `body`. It is quoted-printable if all
/// its line breaks are CRLF already, and base64 otherwise.
pub fn write_mime_tree(
    mut out: impl Write,
    body: &str,
    attachments: &[OutgoingAttachment],
) -> Result<(), Error> {
    let body_part = body_part(body)?;
    if attachments.is_empty() {
        out.write_all(&body_part)?;
        return Ok(());
    }

    let mut parts = Vec::with_capacity(attachments.len() + 1);
    parts.push(body_part);

    for attachment in attachments {
        parts.push(attachment_part(attachment)?);
    }

    let boundary = generate_boundary(
        &parts.iter().map(|p| &p[..]).collect::<Vec<_>>(),
    )?;

    write!(
        out,
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary,
    )?;
    for part in &parts {
        write!(out, "--{}\r\n", boundary)?;
        out.write_all(part)?;
        out.write_all(b"\r\n")?;
    }
    write!(out, "--{}--\r\n", boundary)?;

    Ok(())
}

fn body_part(body: &str) -> Result<Vec<u8>, Error> {
    let mut part = Vec::new();
    if has_crlf_line_breaks(body.as_bytes()) {
        part.extend_from_slice(
            b"Content-Type: text/plain; charset=\"utf-8\"\r\n\
              Content-Transfer-Encoding: quoted-printable\r\n\
              \r\n",
        );
        part.extend_from_slice(&qp_encode(body.as_bytes()));
    } else {
        part.extend_from_slice(
            b"Content-Type: text/plain; charset=\"utf-8\"\r\n\
              Content-Transfer-Encoding: base64\r\n\
              \r\n",
        );
        write_base64_lines(&mut part, body.as_bytes())?;
        part.truncate(part.len().saturating_sub(2));
    }

    Ok(part)
}

/// Whether every LF in `text` ends a CRLF pair.
fn has_crlf_line_breaks(text: &[u8]) -> bool {
    memchr::memchr_iter(b'\n', text).all(|ix| ix > 0 && b'\r' == text[ix - 1])
}

fn attachment_part(attachment: &OutgoingAttachment) -> Result<Vec<u8>, Error> {
    let content_type = if attachment.content_type.is_empty() {
        "application/octet-stream"
    } else {
        &attachment.content_type
    };
    if content_type.bytes().any(|b| b.is_ascii_control()) {
        return Err(Error::EnvelopeBuildFailed(format!(
            "invalid content type for attachment {:?}",
            attachment.filename,
        )));
    }

    let mut part = Vec::new();
    write!(
        part,
        "Content-Type: {}; {}\r\n\
         Content-Transfer-Encoding: base64\r\n\
         Content-Disposition: attachment; {}\r\n",
        content_type,
        filename_parm("name", &attachment.filename),
        filename_parm("filename", &attachment.filename),
    )?;
    if let Some(ref cid) = attachment.content_id {
        let cid = cid.trim_matches(&['<', '>'][..]);
        if cid.chars().any(char::is_control) {
            return Err(Error::EnvelopeBuildFailed(format!(
                "invalid content id for attachment {:?}",
                attachment.filename,
            )));
        }
        write!(part, "Content-ID: <{}>\r\n", cid)?;
    }
    part.extend_from_slice(b"\r\n");
    write_base64_lines(&mut part, &attachment.data)?;
    // The final line ending belongs to the next boundary
    part.truncate(part.len().saturating_sub(2));

    Ok(part)
}

fn filename_parm(name: &str, value: &str) -> String {
    if value.bytes().all(|b| (b' '..=b'~').contains(&b)) {
        format!("{}={}", name, quote(value))
    } else {
        format!("{}*={}", name, encode_rfc2231(value))
    }
}
