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

//! Construction of the signed and encrypted envelopes.
//!
//! See RFC 1847 (security multiparts), RFC 3156 (OpenPGP/MIME) and RFC 8551
//! (S/MIME).

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::extract::{self, ExtractOptions};
use super::grovel::{self, Visitor};
use super::header::ContentType;
use crate::engine::Protocol;
use crate::support::error::Error;

/// Boundaries start with `=_`, which can occur neither in quoted-printable
/// nor in base64 output.
const BOUNDARY_PREFIX: &str = "=_";
const BOUNDARY_RANDOM_LEN: usize = 32;
const MAX_BOUNDARY_ATTEMPTS: u32 = 16;

const BASE64_LINE: usize = 76;

/// Generate a random multipart boundary which does not occur in any of
/// `contents`.
pub fn generate_boundary(contents: &[&[u8]]) -> Result<String, Error> {
    for _ in 0..MAX_BOUNDARY_ATTEMPTS {
        let boundary = format!(
            "{}{}",
            BOUNDARY_PREFIX,
            rand::rngs::OsRng
                .sample_iter(Alphanumeric)
                .take(BOUNDARY_RANDOM_LEN)
                .map(char::from)
                .collect::<String>(),
        );

        if is_safe_boundary(&boundary, contents) {
            return Ok(boundary);
        }
    }

    Err(Error::EnvelopeBuildFailed(
        "could not find a boundary absent from the content".to_owned(),
    ))
}

/// Whether `boundary` does not occur in any of `contents`.
pub fn is_safe_boundary(boundary: &str, contents: &[&[u8]]) -> bool {
    let finder = memchr::memmem::Finder::new(boundary.as_bytes());
    contents.iter().all(|c| finder.find(c).is_none())
}

/// Compute the `micalg` parameter for a signature made with `hash_algorithm`.
pub fn micalg(protocol: Protocol, hash_algorithm: &str) -> String {
    let micalg = if Protocol::OpenPgp == protocol {
        format!("pgp-{}", hash_algorithm)
    } else {
        hash_algorithm.to_owned()
    };
    micalg.to_ascii_lowercase()
}

/// Write `data` as base64, in lines of 76 characters each terminated by
/// CRLF.
pub fn write_base64_lines(
    mut out: impl Write,
    data: &[u8],
) -> io::Result<()> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    for line in encoded.as_bytes().chunks(BASE64_LINE) {
        out.write_all(line)?;
        out.write_all(b"\r\n")?;
    }
    Ok(())
}

fn require_protocol(protocol: Protocol) -> Result<Protocol, Error> {
    if Protocol::Unknown == protocol {
        Err(Error::EnvelopeBuildFailed(
            "protocol was never resolved".to_owned(),
        ))
    } else {
        Ok(protocol)
    }
}

/// Write a `multipart/signed` envelope around `signed_data`.
///
/// `signed_data` is written verbatim; it must be exactly what the signature
/// was computed over. `signature` is the raw output of the engine: ASCII
/// armor for OpenPGP, DER for S/MIME.
pub fn write_signed(
    mut out: impl Write,
    protocol: Protocol,
    micalg: &str,
    signed_data: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    let protocol = require_protocol(protocol)?;
    let boundary = generate_boundary(&[signed_data, signature])?;
    let signature_type = match protocol {
        Protocol::OpenPgp => "application/pgp-signature",
        _ => "application/pkcs7-signature",
    };

    write!(
        out,
        "MIME-Version: 1.0\r\n\
         Content-Type: multipart/signed;\r\n\
         \tprotocol=\"{}\";\r\n\
         \tmicalg=\"{}\";\r\n\
         \tboundary=\"{}\"\r\n\
         \r\n\
         --{}\r\n",
        signature_type, micalg, boundary, boundary,
    )?;

    // The line ending before the next delimiter belongs to the delimiter, so
    // the first part's content is exactly `signed_data`.
    out.write_all(signed_data)?;
    write!(out, "\r\n--{}\r\n", boundary)?;

    match protocol {
        Protocol::OpenPgp => {
            out.write_all(b"Content-Type: application/pgp-signature\r\n\r\n")?;
            out.write_all(signature)?;
        },
        _ => {
            out.write_all(
                b"Content-Transfer-Encoding: base64\r\n\
                  Content-Type: application/pkcs7-signature\r\n\r\n",
            )?;
            write_base64_lines(&mut out, signature)?;
        },
    }

    write!(out, "\r\n\r\n--{}--\r\n", boundary)?;
    Ok(())
}

/// Write the encrypted envelope around `ciphertext`.
///
/// For OpenPGP this is a `multipart/encrypted` with the version control part
/// and the armored ciphertext verbatim. For S/MIME it is an opaque
/// `application/pkcs7-mime` blob, which has no boundary at all.
pub fn write_encrypted(
    mut out: impl Write,
    protocol: Protocol,
    ciphertext: &[u8],
) -> Result<(), Error> {
    match require_protocol(protocol)? {
        Protocol::OpenPgp => {
            let boundary = generate_boundary(&[ciphertext])?;
            write!(
                out,
                "MIME-Version: 1.0\r\n\
                 Content-Type: multipart/encrypted;\r\n\
                 \tprotocol=\"application/pgp-encrypted\";\r\n\
                 \tboundary=\"{b}\"\r\n\
                 \r\n\
                 This is an OpenPGP/MIME encrypted message (RFC 3156).\r\n\
                 --{b}\r\n\
                 Content-Type: application/pgp-encrypted\r\n\
                 Content-Description: PGP/MIME version identification\r\n\
                 \r\n\
                 Version: 1\r\n\
                 \r\n\
                 --{b}\r\n\
                 Content-Type: application/octet-stream; name=\"encrypted.asc\"\r\n\
                 Content-Description: OpenPGP encrypted message\r\n\
                 Content-Disposition: inline; filename=\"encrypted.asc\"\r\n\
                 \r\n",
                b = boundary,
            )?;
            out.write_all(ciphertext)?;
            write!(out, "\r\n--{}--\r\n", boundary)?;
        },
        _ => {
            out.write_all(
                b"MIME-Version: 1.0\r\n\
                  Content-Type: application/pkcs7-mime;\r\n\
                  \tsmime-type=enveloped-data; name=\"smime.p7m\"\r\n\
                  Content-Disposition: attachment; filename=\"smime.p7m\"\r\n\
                  Content-Transfer-Encoding: base64\r\n\
                  \r\n",
            )?;
            write_base64_lines(&mut out, ciphertext)?;
        },
    }

    Ok(())
}

/// The two halves of a `multipart/signed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedParts {
    /// The first part, byte for byte as it was signed, headers included.
    pub signed_data: Vec<u8>,
    /// The decoded content of the signature part.
    pub signature: Vec<u8>,
}

/// Split the `multipart/signed` message in `message` into the signed part
/// and the signature.
pub fn split_signed(message: &[u8]) -> Result<SignedParts, Error> {
    let raw_parts = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
    let is_signed = grovel::grovel(
        message,
        SignedSplitter {
            raw_parts: Rc::clone(&raw_parts),
            is_signed: false,
        },
    )?;

    if !is_signed {
        return Err(Error::ParserAnomaly("not a multipart/signed".to_owned()));
    }

    let mut raw_parts = raw_parts.take().into_iter();
    let (Some(signed_data), Some(signature_part)) =
        (raw_parts.next(), raw_parts.next())
    else {
        return Err(Error::ParserAnomaly(
            "multipart/signed without signature part".to_owned(),
        ));
    };

    let signature = extract::extract(
        &signature_part[..],
        ExtractOptions {
            convert_charsets: false,
            max_line_length: usize::MAX,
        },
    )?;
    let signature = signature
        .attachments
        .into_iter()
        .next()
        .map(|a| a.data)
        .or_else(|| signature.body.map(|b| b.text.into_bytes()))
        .unwrap_or_default();

    Ok(SignedParts {
        signed_data,
        signature,
    })
}

#[derive(Debug)]
struct SignedSplitter {
    raw_parts: Rc<RefCell<Vec<Vec<u8>>>>,
    is_signed: bool,
}

impl Visitor for SignedSplitter {
    type Output = bool;

    fn content_type(&mut self, ct: &ContentType<'_>) -> Result<(), bool> {
        if ct.is("multipart", "signed") {
            self.is_signed = true;
            Ok(())
        } else {
            Err(false)
        }
    }

    fn start_part(&mut self) -> Option<Box<dyn Visitor<Output = bool>>> {
        if self.raw_parts.borrow().len() >= 2 {
            return None;
        }

        self.raw_parts.borrow_mut().push(Vec::new());
        Some(Box::new(RawPart {
            raw_parts: Rc::clone(&self.raw_parts),
        }))
    }

    fn end(&mut self) -> bool {
        self.is_signed
    }
}

/// Accumulates the raw bytes of the most recently started part.
#[derive(Debug)]
struct RawPart {
    raw_parts: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Visitor for RawPart {
    type Output = bool;

    fn raw_line(&mut self, line: &[u8]) -> Result<(), bool> {
        if let Some(part) = self.raw_parts.borrow_mut().last_mut() {
            part.extend_from_slice(line);
        }
        Ok(())
    }

    fn end(&mut self) -> bool {
        // The final line ending belongs to the boundary
        if let Some(part) = self.raw_parts.borrow_mut().last_mut() {
            if part.ends_with(b"\r\n") {
                part.truncate(part.len() - 2);
            } else if part.ends_with(b"\n") {
                part.truncate(part.len() - 1);
            }
        }
        true
    }
}
