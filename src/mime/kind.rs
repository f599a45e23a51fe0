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

use std::io::{self, Read};

use super::content_encoding::{CharsetMode, ContentDecoder};
use super::grovel::{self, Visitor};
use super::header::ContentType;
use crate::engine::Protocol;

/// The shape of the protection of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EnvelopeKind {
    /// Not protected, or protected in some way we don't understand.
    #[default]
    None,
    /// OpenPGP armor directly in a text body.
    PgpInline {
        /// A clear-signed text rather than an encrypted message.
        signed_only: bool,
    },
    /// `multipart/encrypted` with `application/pgp-encrypted`.
    PgpMime,
    /// `multipart/signed` with `application/pgp-signature`.
    PgpSigned,
    /// `application/pkcs7-mime`.
    SmimeOpaque {
        /// `smime-type=signed-data` rather than `enveloped-data`.
        signed_only: bool,
    },
    /// `multipart/signed` with a PKCS#7 signature.
    SmimeSigned,
    /// A Web Key Service confirmation request.
    WksConfirmation,
}

impl EnvelopeKind {
    pub fn protocol(self) -> Protocol {
        match self {
            EnvelopeKind::PgpInline { .. }
            | EnvelopeKind::PgpMime
            | EnvelopeKind::PgpSigned
            | EnvelopeKind::WksConfirmation => Protocol::OpenPgp,
            EnvelopeKind::SmimeOpaque { .. } | EnvelopeKind::SmimeSigned => {
                Protocol::Smime
            },
            EnvelopeKind::None => Protocol::Unknown,
        }
    }

    /// Whether this kind is something the parse job can unprotect.
    pub fn is_crypto(self) -> bool {
        !matches!(self, EnvelopeKind::None | EnvelopeKind::WksConfirmation)
    }

    pub fn is_smime(self) -> bool {
        Protocol::Smime == self.protocol()
    }

    /// Whether unprotecting needs a decryption step, as opposed to only
    /// signature verification.
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            EnvelopeKind::PgpInline { signed_only: false }
                | EnvelopeKind::PgpMime
                | EnvelopeKind::SmimeOpaque { signed_only: false }
        )
    }
}

/// Determine the `EnvelopeKind` of the RFC 822 message in `reader`.
///
/// Only as much of the message is read as is needed to decide.
pub fn classify(reader: impl Read) -> io::Result<EnvelopeKind> {
    grovel::grovel(
        reader,
        ContentDecoder::new(Box::new(Classifier::default()), CharsetMode::Raw),
    )
}

/// Determine the `EnvelopeKind` from a top-level content type alone.
///
/// Returns `None` if the content type leaves the question open, i.e., the
/// body of a `text/plain` part must be inspected for inline armor.
pub fn classify_content_type(ct: &ContentType<'_>) -> Option<EnvelopeKind> {
    if ct.is("multipart", "encrypted") {
        Some(if ct.parm_is("protocol", "application/pgp-encrypted") {
            EnvelopeKind::PgpMime
        } else {
            EnvelopeKind::None
        })
    } else if ct.is("multipart", "signed") {
        Some(if ct.parm_is("protocol", "application/pgp-signature") {
            EnvelopeKind::PgpSigned
        } else if ct.parm_is("protocol", "application/pkcs7-signature")
            || ct.parm_is("protocol", "application/x-pkcs7-signature")
        {
            EnvelopeKind::SmimeSigned
        } else {
            EnvelopeKind::None
        })
    } else if ct.is("application", "pkcs7-mime")
        || ct.is("application", "x-pkcs7-mime")
    {
        Some(EnvelopeKind::SmimeOpaque {
            signed_only: ct.parm_is("smime-type", "signed-data"),
        })
    } else if ct.is("application", "vnd.gnupg.wks") {
        Some(EnvelopeKind::WksConfirmation)
    } else if ct.is("text", "plain") {
        None
    } else {
        Some(EnvelopeKind::None)
    }
}

const ARMOR_MESSAGE: &[u8] = b"-----BEGIN PGP MESSAGE-----";
const ARMOR_SIGNED: &[u8] = b"-----BEGIN PGP SIGNED MESSAGE-----";

/// Classify the start of a text body.
///
/// `start` is everything seen so far. Returns `None` if more is needed.
pub fn classify_text_start(start: &[u8], at_end: bool) -> Option<EnvelopeKind> {
    let Some(first) = start
        .iter()
        .position(|b| !matches!(*b, b' ' | b'\t' | b'\r' | b'\n'))
    else {
        return at_end.then_some(EnvelopeKind::None);
    };

    let line = &start[first..];
    for (armor, signed_only) in [(ARMOR_MESSAGE, false), (ARMOR_SIGNED, true)]
    {
        if line.starts_with(armor) {
            let rest = &line[armor.len()..];
            if rest.is_empty() && !at_end {
                return None;
            }

            if rest.is_empty() || rest.starts_with(b"\r") || rest.starts_with(b"\n")
            {
                return Some(EnvelopeKind::PgpInline { signed_only });
            }
        } else if armor.starts_with(line) && !at_end {
            // Could still become the armor header
            return None;
        }
    }

    Some(EnvelopeKind::None)
}

/// The longest text prefix buffered while looking for armor.
const MAX_SNIFF: usize = 256;

#[derive(Debug, Default)]
struct Classifier {
    sniffed: Vec<u8>,
}

impl Visitor for Classifier {
    type Output = EnvelopeKind;

    fn content_type(
        &mut self,
        ct: &ContentType<'_>,
    ) -> Result<(), EnvelopeKind> {
        match classify_content_type(ct) {
            Some(kind) => Err(kind),
            None => Ok(()),
        }
    }

    fn content(&mut self, data: &[u8]) -> Result<(), EnvelopeKind> {
        let room = MAX_SNIFF.saturating_sub(self.sniffed.len());
        self.sniffed.extend_from_slice(&data[..data.len().min(room)]);

        let at_end = self.sniffed.len() >= MAX_SNIFF;
        match classify_text_start(&self.sniffed, at_end) {
            Some(kind) => Err(kind),
            None => Ok(()),
        }
    }

    fn end(&mut self) -> EnvelopeKind {
        classify_text_start(&self.sniffed, true).unwrap_or_default()
    }
}
