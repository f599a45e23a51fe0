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

use std::io::{self, Write};
use std::sync::Arc;

use log::{info, warn};

use super::JobContext;
use crate::engine::{CryptoEngine, DecryptResult, VerifyResult};
use crate::mime::content_encoding;
use crate::mime::envelope;
use crate::mime::extract::{
    self, ExtractOptions, ExtractWriter, Extracted, ExtractedAttachment,
    TextBody,
};
use crate::mime::kind::{self, EnvelopeKind};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::threading;

/// Shown when a PGP/MIME message decrypts to something with no text.
pub const NO_PLAIN_BODY: &str = "[PGP/MIME message without plain text body]";

/// What a successful parse produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParseResult {
    pub kind: EnvelopeKind,
    /// Present if the message was encrypted.
    pub decrypt: Option<DecryptResult>,
    pub verify: Option<VerifyResult>,
    pub body: Option<TextBody>,
    pub html_body: Option<TextBody>,
    pub attachments: Vec<ExtractedAttachment>,
}

/// Why a parse failed, with the explanation to show in place of the body.
#[derive(Debug)]
pub struct ParseFailure {
    pub error: Error,
    pub text: String,
}

impl ParseFailure {
    /// The failure of a parse of `kind` which ended without a result.
    pub fn aborted(kind: EnvelopeKind, diagnostic: String) -> Self {
        let error = Error::EngineOperationFailed(diagnostic);
        ParseFailure {
            text: format_error_text(kind, &error, None),
            error,
        }
    }
}

/// One unprotect operation.
///
/// Jobs are shared (`Arc`) between the message that started them and the
/// thread running them, so a job outlives a message destroyed while it is
/// still parsing.
pub struct ParseJob {
    uid: String,
    kind: EnvelopeKind,
    input: Vec<u8>,
    engine: Arc<dyn CryptoEngine>,
    options: ExtractOptions,
    log_prefix: LogPrefix,
}

impl ParseJob {
    /// `input` is the complete RFC 822 form of the message.
    pub fn new(
        uid: String,
        kind: EnvelopeKind,
        input: Vec<u8>,
        context: &JobContext,
        log_prefix: LogPrefix,
    ) -> Self {
        ParseJob {
            uid,
            kind,
            input,
            engine: Arc::clone(&context.engine),
            options: ExtractOptions::from(&context.config.parser),
            log_prefix,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    /// Parse the message.
    ///
    /// Only one parse runs at a time in the whole process.
    pub fn run(&self) -> Result<ParseResult, ParseFailure> {
        threading::serialize_parsing(|| {
            info!("{} Parsing {:?} message", self.log_prefix, self.kind);
            let mut verify = None;
            let result = self.parse(&mut verify);
            result.map_err(|error| {
                warn!("{} Parsing failed: {}", self.log_prefix, error);
                ParseFailure {
                    text: format_error_text(self.kind, &error, verify.as_ref()),
                    error,
                }
            })
        })
    }

    fn parse(
        &self,
        verify_out: &mut Option<VerifyResult>,
    ) -> Result<ParseResult, Error> {
        let protocol = self.kind.protocol();
        let mut result = ParseResult {
            kind: self.kind,
            ..ParseResult::default()
        };

        match self.kind {
            EnvelopeKind::None | EnvelopeKind::WksConfirmation => {
                return Err(Error::StateMismatch(format!(
                    "{:?} messages are not unprotected",
                    self.kind,
                )));
            },

            EnvelopeKind::PgpMime => {
                let outer = self.extract_outer()?;
                let ciphertext = outer
                    .attachments
                    .into_iter()
                    .find(|a| "application/octet-stream" == a.content_type)
                    .ok_or_else(|| {
                        Error::ParserAnomaly(
                            "PGP/MIME message without encrypted part".to_owned(),
                        )
                    })?;

                let (decrypt, verify, extracted) =
                    self.decrypt_mime(&ciphertext.data)?;
                result.decrypt = Some(decrypt);
                *verify_out = Some(verify);
                self.fold_extracted(&mut result, extracted)?;
                if result.body.is_none() && result.html_body.is_none() {
                    result.body = Some(TextBody {
                        text: NO_PLAIN_BODY.to_owned(),
                        charset: "utf-8".to_owned(),
                    });
                }
            },

            EnvelopeKind::SmimeOpaque { signed_only } => {
                let outer = self.extract_outer()?;
                let blob = outer
                    .attachments
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::ParserAnomaly("empty S/MIME message".to_owned())
                    })?;

                if signed_only {
                    let mut writer = ExtractWriter::new(self.options);
                    let verify = self.engine.verify_opaque(
                        protocol,
                        &mut &blob.data[..],
                        &mut writer,
                    )?;
                    *verify_out = Some(verify);
                    self.fold_extracted(&mut result, writer.finish())?;
                } else {
                    let (decrypt, verify, extracted) =
                        self.decrypt_mime(&blob.data)?;
                    result.decrypt = Some(decrypt);
                    *verify_out = Some(verify);
                    self.fold_extracted(&mut result, extracted)?;
                }
            },

            EnvelopeKind::PgpSigned | EnvelopeKind::SmimeSigned => {
                let parts = envelope::split_signed(&self.input)?;
                let verify = self.engine.verify_detached(
                    protocol,
                    &parts.signed_data,
                    &parts.signature,
                )?;
                *verify_out = Some(verify);
                let extracted =
                    extract::extract(&parts.signed_data[..], self.options)?;
                self.fold_extracted(&mut result, extracted)?;
            },

            EnvelopeKind::PgpInline { signed_only } => {
                let outer = self.extract_outer()?;
                let armored = outer.body.ok_or_else(|| {
                    Error::ParserAnomaly(
                        "inline message without text body".to_owned(),
                    )
                })?;

                let mut plaintext = Vec::new();
                if signed_only {
                    *verify_out = Some(self.engine.verify_opaque(
                        protocol,
                        &mut armored.text.as_bytes(),
                        &mut plaintext,
                    )?);
                } else {
                    let (decrypt, verify) = self.engine.decrypt_verify(
                        protocol,
                        &mut armored.text.as_bytes(),
                        &mut plaintext,
                    )?;
                    result.decrypt = Some(decrypt);
                    *verify_out = Some(verify);
                }

                // The armor carries no charset of its own; the sender
                // encrypted the text in the one the part declares.
                result.body = Some(TextBody {
                    text: content_encoding::text_to_utf8(
                        &plaintext,
                        &armored.charset,
                        self.options.charset_mode(),
                    ),
                    charset: armored.charset,
                });
                result.attachments = outer.attachments;
            },
        }

        if let Some(mut verify) = verify_out.take() {
            if verify.signatures.is_empty() {
                if let Some(ref error) = verify.error {
                    let error = Error::EngineOperationFailed(error.clone());
                    *verify_out = Some(verify);
                    return Err(error);
                }
            }

            self.complete_signature_keys(&mut verify);
            *verify_out = Some(verify.clone());
            result.verify = Some(verify);
        }

        info!(
            "{} Parsed: {} attachments, decrypted={}, signatures={}",
            self.log_prefix,
            result.attachments.len(),
            result.decrypt.is_some(),
            result.verify.as_ref().map_or(0, |v| v.signatures.len()),
        );
        Ok(result)
    }

    /// Extract the structure of the (still protected) outer message.
    fn extract_outer(&self) -> Result<Extracted, Error> {
        Ok(extract::extract(&self.input[..], self.options)?)
    }

    /// Decrypt `ciphertext` and extract the MIME tree inside.
    ///
    /// A message which was signed before being encrypted decrypts to a
    /// `multipart/signed`, whose signature is verified here as well.
    fn decrypt_mime(
        &self,
        ciphertext: &[u8],
    ) -> Result<(DecryptResult, VerifyResult, Extracted), Error> {
        let mut sink = PlaintextSink::new(self.options);
        let (decrypt, mut verify) = self.engine.decrypt_verify(
            self.kind.protocol(),
            &mut &ciphertext[..],
            &mut sink,
        )?;

        let extracted = match sink.finish()? {
            Plaintext::Extracted(extracted) => extracted,
            Plaintext::Signed { kind, data } => {
                let parts = envelope::split_signed(&data)?;
                let inner = self.engine.verify_detached(
                    kind.protocol(),
                    &parts.signed_data,
                    &parts.signature,
                )?;
                verify.signatures.extend(inner.signatures);
                verify.error = verify.error.or(inner.error);
                extract::extract(&parts.signed_data[..], self.options)?
            },
        };

        Ok((decrypt, verify, extracted))
    }

    /// Move the content of `extracted` into `result`, refusing it if the
    /// parser found it malformed.
    fn fold_extracted(
        &self,
        result: &mut ParseResult,
        extracted: Extracted,
    ) -> Result<(), Error> {
        if let Some(anomaly) = extracted.anomaly {
            return Err(Error::ParserAnomaly(anomaly));
        }

        result.body = extracted.body;
        result.html_body = extracted.html_body;
        result.attachments = extracted.attachments;
        Ok(())
    }

    /// Fill in the full signing key of every signature which lacks one.
    fn complete_signature_keys(&self, verify: &mut VerifyResult) {
        for sig in &mut verify.signatures {
            if sig.key.is_some() || sig.fingerprint.is_empty() {
                continue;
            }

            match self
                .engine
                .list_keys(self.kind.protocol(), &[sig.fingerprint.clone()])
            {
                Ok(keys) => sig.key = keys.into_iter().next(),
                Err(e) => warn!(
                    "{} Failed to look up signing key {}: {}",
                    self.log_prefix, sig.fingerprint, e,
                ),
            }
        }
    }
}

/// Headers beyond this size are not waited for before choosing where
/// decrypted content goes.
const MAX_HEADER_BLOCK: usize = 65536;

/// Receives decrypted content from the engine.
///
/// The header block is held back until it is complete. A `multipart/signed`
/// is then captured whole, since its signature covers the raw bytes of the
/// signed part; anything else streams straight into the extractor.
enum PlaintextSink {
    Headers {
        buffer: Vec<u8>,
        options: ExtractOptions,
    },
    Streaming(ExtractWriter),
    Signed {
        kind: EnvelopeKind,
        data: Vec<u8>,
    },
}

enum Plaintext {
    Extracted(Extracted),
    Signed { kind: EnvelopeKind, data: Vec<u8> },
}

impl PlaintextSink {
    fn new(options: ExtractOptions) -> Self {
        PlaintextSink::Headers {
            buffer: Vec::new(),
            options,
        }
    }

    fn route(buffer: Vec<u8>, options: ExtractOptions) -> io::Result<Self> {
        let kind = kind::classify(&buffer[..])?;
        Ok(match kind {
            EnvelopeKind::PgpSigned | EnvelopeKind::SmimeSigned => {
                PlaintextSink::Signed { kind, data: buffer }
            },
            _ => {
                let mut writer = ExtractWriter::new(options);
                writer.write_all(&buffer)?;
                PlaintextSink::Streaming(writer)
            },
        })
    }

    fn finish(self) -> io::Result<Plaintext> {
        match self {
            PlaintextSink::Headers { buffer, options } => {
                Self::route(buffer, options)?.finish()
            },
            PlaintextSink::Streaming(writer) => {
                Ok(Plaintext::Extracted(writer.finish()))
            },
            PlaintextSink::Signed { kind, data } => {
                Ok(Plaintext::Signed { kind, data })
            },
        }
    }
}

impl Write for PlaintextSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let headers_done = match *self {
            PlaintextSink::Headers { ref mut buffer, .. } => {
                buffer.extend_from_slice(data);
                buffer.len() > MAX_HEADER_BLOCK
                    || header_block_len(buffer).is_some()
            },
            PlaintextSink::Streaming(ref mut writer) => {
                writer.write_all(data)?;
                false
            },
            PlaintextSink::Signed { data: ref mut captured, .. } => {
                captured.extend_from_slice(data);
                false
            },
        };

        if headers_done {
            let PlaintextSink::Headers {
                ref mut buffer,
                options,
            } = *self
            else {
                return Ok(data.len());
            };
            let buffer = std::mem::take(buffer);
            *self = Self::route(buffer, options)?;
        }

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The length of the header block at the start of `data`, including the
/// blank line ending it, if that blank line has been seen.
fn header_block_len(data: &[u8]) -> Option<usize> {
    let mut start = 0;
    for lf in memchr::memchr_iter(b'\n', data) {
        let line = &data[start..=lf];
        if b"\n" == line || b"\r\n" == line {
            return Some(lf + 1);
        }
        start = lf + 1;
    }
    None
}

/// Render a short plain-text explanation of why `kind` could not be
/// unprotected.
pub fn format_error_text(
    kind: EnvelopeKind,
    error: &Error,
    verify: Option<&VerifyResult>,
) -> String {
    let mut text = if kind.is_encrypted() {
        "Decryption failed.\n".to_owned()
    } else {
        "Signature verification failed.\n".to_owned()
    };

    match *error {
        Error::UserCancelled => {
            text.push_str("\nThe operation was cancelled.\n");
        },
        Error::EngineOperationFailed(ref diagnostic) => {
            text.push_str("\nThe crypto engine reported: ");
            text.push_str(diagnostic);
            text.push('\n');
        },
        Error::ParserAnomaly(ref anomaly) => {
            text.push_str("\nThe message is malformed: ");
            text.push_str(anomaly);
            text.push('\n');
        },
        ref other => {
            text.push('\n');
            text.push_str(&other.to_string());
            text.push('\n');
        },
    }

    for sig in verify.iter().flat_map(|v| v.signatures.iter()) {
        text.push_str("\nSignature by ");
        text.push_str(&sig.fingerprint);
        if let Some(created) = sig.creation_time {
            text.push_str(&created.format(" made %Y-%m-%d %H:%M:%S UTC").to_string());
        }
        if let Some(ref status) = sig.status {
            text.push_str(": ");
            text.push_str(status);
        }
        text.push('\n');
    }

    text
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;
    use proptest::prelude::*;

    use super::*;
    use crate::engine::{Protocol, Signature, Summary, Validity};
    use crate::job::crypt::{CryptJob, CryptRequest, Envelope};
    use crate::mime::builder::OutgoingAttachment;
    use crate::test_support::{test_context, test_key};

    fn keys() -> Vec<crate::engine::Key> {
        vec![
            test_key("AAAA0001", "a@example.org", Validity::Ultimate, true),
            test_key("BBBB0002", "b@example.org", Validity::Full, true),
        ]
    }

    fn protect(
        context: &JobContext,
        sign: bool,
        encrypt: bool,
        inline: bool,
        body: &str,
        attachments: Vec<OutgoingAttachment>,
    ) -> Vec<u8> {
        let request = CryptRequest {
            sign,
            encrypt,
            inline,
            sender: "a@example.org".to_owned(),
            recipients: vec!["b@example.org".to_owned()],
            body: body.to_owned(),
            attachments,
            ..CryptRequest::default()
        };
        match CryptJob::new(request, context, LogPrefix::new("test"))
            .execute()
            .unwrap()
            .envelope
        {
            Envelope::Mime(mime) => mime,
            Envelope::Inline(text) => format!(
                "Content-Type: text/plain; charset=utf-8\r\n\r\n{}",
                text
            )
            .into_bytes(),
        }
    }

    fn parse(
        context: &JobContext,
        message: Vec<u8>,
    ) -> Result<ParseResult, ParseFailure> {
        let kind = kind::classify(&message[..]).unwrap();
        ParseJob::new(
            "uid".to_owned(),
            kind,
            message,
            context,
            LogPrefix::new("test"),
        )
        .run()
    }

    #[test]
    fn round_trip_sign_encrypt_with_attachments() {
        let (context, _, _) = test_context(keys());
        let binary = (0..=255u8).cycle().take(5000).collect::<Vec<u8>>();
        let message = protect(
            &context,
            true,
            true,
            false,
            "Hello Bob,\n\nsee attached.\n",
            vec![
                OutgoingAttachment {
                    filename: "data.bin".to_owned(),
                    content_type: "application/octet-stream".to_owned(),
                    content_id: None,
                    data: binary.clone(),
                },
                OutgoingAttachment {
                    filename: "empty.txt".to_owned(),
                    content_type: "text/plain".to_owned(),
                    content_id: Some("cid-1".to_owned()),
                    data: Vec::new(),
                },
            ],
        );

        let result = parse(&context, message).unwrap();
        assert_eq!(EnvelopeKind::PgpMime, result.kind);
        assert_eq!("Hello Bob,\n\nsee attached.\n", result.body.unwrap().text);

        assert_eq!(2, result.attachments.len());
        assert_eq!("data.bin", result.attachments[0].display_name);
        assert_eq!(binary, result.attachments[0].data);
        assert_eq!("empty.txt", result.attachments[1].display_name);
        assert_eq!(Some("cid-1".to_owned()), result.attachments[1].content_id);
        assert!(result.attachments[1].data.is_empty());

        let decrypt = result.decrypt.unwrap();
        assert_eq!(vec!["BBBB0002".to_owned()], decrypt.recipient_key_ids);
        assert!(decrypt.is_de_vs);

        let verify = result.verify.unwrap();
        assert_eq!(1, verify.signatures.len());
        let sig = &verify.signatures[0];
        assert!(!sig.is_bad());
        assert_eq!("AAAA0001", sig.fingerprint);
        assert!(sig.is_de_vs);
        assert_eq!(Validity::Ultimate, sig.validity);
        assert_eq!("AAAA0001", sig.key.as_ref().unwrap().fingerprint);
    }

    #[test]
    fn round_trip_sign_only_and_encrypt_only() {
        let (context, _, _) = test_context(keys());

        let signed = protect(&context, true, false, false, "signed", vec![]);
        let result = parse(&context, signed).unwrap();
        assert_eq!(EnvelopeKind::PgpSigned, result.kind);
        assert_eq!("signed", result.body.unwrap().text);
        assert_eq!(None, result.decrypt);
        assert!(result.verify.unwrap().has_good_signature());

        let encrypted = protect(&context, false, true, false, "secret", vec![]);
        let result = parse(&context, encrypted).unwrap();
        assert_eq!("secret", result.body.unwrap().text);
        assert!(result.verify.unwrap().signatures.is_empty());
    }

    #[test]
    fn round_trip_inline() {
        let (context, _, _) = test_context(keys());

        let message = protect(&context, true, true, true, "inline secret", vec![]);
        let result = parse(&context, message).unwrap();
        assert_eq!(EnvelopeKind::PgpInline { signed_only: false }, result.kind);
        assert_eq!("inline secret", result.body.unwrap().text);
        assert!(result.verify.unwrap().has_good_signature());

        let message = protect(&context, true, false, true, "clear text", vec![]);
        let result = parse(&context, message).unwrap();
        assert_eq!(EnvelopeKind::PgpInline { signed_only: true }, result.kind);
        assert_eq!("clear text", result.body.unwrap().text);
        assert!(result.verify.unwrap().has_good_signature());
    }

    #[test]
    fn round_trip_smime() {
        let mut keys = keys();
        for key in &mut keys {
            key.protocol = Protocol::Smime;
        }
        let (context, _, _) = test_context(keys);
        let request = CryptRequest {
            sign: true,
            encrypt: true,
            sender: "a@example.org".to_owned(),
            recipients: vec!["b@example.org".to_owned()],
            protocol: Protocol::Smime,
            body: "opaque".to_owned(),
            ..CryptRequest::default()
        };
        let Envelope::Mime(message) =
            CryptJob::new(request, &context, LogPrefix::new("test"))
                .execute()
                .unwrap()
                .envelope
        else {
            panic!("expected MIME");
        };

        let result = parse(&context, message).unwrap();
        assert_eq!(EnvelopeKind::SmimeOpaque { signed_only: false }, result.kind);
        assert_eq!("opaque", result.body.unwrap().text);
        assert!(result.verify.unwrap().has_good_signature());
    }

    #[test]
    fn tampered_signature_is_parsed_but_bad() {
        let (context, _, _) = test_context(keys());
        let signed = protect(&context, true, false, false, "original", vec![]);
        let tampered = String::from_utf8(signed)
            .unwrap()
            .replace("original", "modified")
            .into_bytes();

        let result = parse(&context, tampered).unwrap();
        assert_eq!("modified", result.body.unwrap().text);
        let verify = result.verify.unwrap();
        assert_eq!(1, verify.signatures.len());
        assert!(verify.signatures[0].is_bad());
        assert!(!verify.has_good_signature());
    }

    #[test]
    fn no_secret_key_fails_with_text() {
        let (context, engine, _) = test_context(keys());
        let message = protect(&context, false, true, false, "secret", vec![]);
        engine.forget_secrets();

        let failure = parse(&context, message).unwrap_err();
        assert_matches!(Error::EngineOperationFailed(_), failure.error);
        assert!(failure.text.starts_with("Decryption failed."));
        assert!(failure.text.contains("No secret key"));
    }

    #[test]
    fn verify_error_without_signatures_is_a_failure() {
        let (context, _, _) = test_context(keys());
        let mut message = protect(&context, true, false, false, "x", vec![]);
        let text = String::from_utf8(message).unwrap();
        message = text.replace("AAAA0001:", "garbage").into_bytes();

        let failure = parse(&context, message).unwrap_err();
        assert_matches!(Error::EngineOperationFailed(_), failure.error);
        assert!(failure.text.starts_with("Signature verification failed."));
    }

    #[test]
    fn decrypted_line_too_long_is_an_anomaly() {
        let (mut context, engine, _) = test_context(keys());
        let mut config = (*context.config).clone();
        config.parser.max_line_length = 100;
        context.config = Arc::new(config);

        let message =
            protect(&context, false, true, false, &"x".repeat(50), vec![]);
        assert!(parse(&context, message).is_ok());

        let mut mime = b"Content-Type: text/plain\r\n\r\n".to_vec();
        mime.extend(std::iter::repeat(b'z').take(1000));
        let ciphertext =
            engine.encrypt_to_vec(Protocol::OpenPgp, &keys()[1..], &mime);
        let mut message = Vec::new();
        envelope::write_encrypted(&mut message, Protocol::OpenPgp, &ciphertext)
            .unwrap();

        let failure = parse(&context, message).unwrap_err();
        assert_matches!(Error::ParserAnomaly(_), failure.error);
        assert!(failure.text.contains("line too long"));
    }

    #[test]
    fn pgp_mime_without_text_gets_placeholder() {
        let (context, engine, _) = test_context(keys());
        let mime = b"Content-Type: image/png\r\n\r\n\x89PNG".to_vec();
        let ciphertext =
            engine.encrypt_to_vec(Protocol::OpenPgp, &keys()[1..], &mime);
        let mut message = Vec::new();
        envelope::write_encrypted(&mut message, Protocol::OpenPgp, &ciphertext)
            .unwrap();

        let result = parse(&context, message).unwrap();
        assert_eq!(NO_PLAIN_BODY, result.body.unwrap().text);
        assert_eq!(1, result.attachments.len());
    }

    #[test]
    fn inline_plaintext_uses_declared_charset() {
        let (context, engine, _) = test_context(keys());
        let inline = |charset: &str, plaintext: &[u8]| {
            let mut message = format!(
                "Content-Type: text/plain; charset={}\r\n\r\n",
                charset,
            )
            .into_bytes();
            message.extend_from_slice(&engine.encrypt_to_vec(
                Protocol::OpenPgp,
                &keys()[1..],
                plaintext,
            ));
            parse(&context, message).unwrap()
        };

        let result = inline("iso-8859-1", b"Gr\xfc\xdfe");
        assert_eq!(EnvelopeKind::PgpInline { signed_only: false }, result.kind);
        let body = result.body.unwrap();
        assert_eq!("Grüße", body.text);
        assert_eq!("iso-8859-1", body.charset);

        let result = inline("windows-1252", b"\x80 5");
        assert_eq!("\u{20ac} 5", result.body.unwrap().text);

        let result = inline("utf-8", "naïve".as_bytes());
        assert_eq!("naïve", result.body.unwrap().text);
    }

    #[test]
    fn plaintext_sink_streams_unsigned_content() {
        let mime = b"Content-Type: multipart/mixed; boundary=b\r\n\
                     \r\n\
                     --b\r\n\
                     \r\n\
                     body\r\n\
                     --b\r\n\
                     Content-Type: application/zip\r\n\
                     \r\n\
                     PK\r\n\
                     --b--\r\n";
        for chunk_size in [1, 7, mime.len()] {
            let mut sink = PlaintextSink::new(ExtractOptions::default());
            for chunk in mime.chunks(chunk_size) {
                sink.write_all(chunk).unwrap();
            }
            assert!(matches!(sink, PlaintextSink::Streaming(_)));

            let Plaintext::Extracted(extracted) = sink.finish().unwrap() else {
                panic!("signed content found in unsigned message");
            };
            assert_eq!("body", extracted.body.unwrap().text);
            assert_eq!(b"PK".to_vec(), extracted.attachments[0].data);
        }
    }

    #[test]
    fn plaintext_sink_captures_signed_content() {
        let mime = b"Content-Type: multipart/signed; boundary=b;\r\n \
                     protocol=\"application/pgp-signature\"\r\n\
                     \r\n\
                     --b\r\n";
        let mut sink = PlaintextSink::new(ExtractOptions::default());
        for chunk in mime.chunks(3) {
            sink.write_all(chunk).unwrap();
        }

        match sink.finish().unwrap() {
            Plaintext::Signed { kind, data } => {
                assert_eq!(EnvelopeKind::PgpSigned, kind);
                assert_eq!(&mime[..], &data[..]);
            },
            Plaintext::Extracted(_) => panic!("signed content not captured"),
        }

        // Never completed headers are still classified
        let sink = PlaintextSink::new(ExtractOptions::default());
        assert!(matches!(sink.finish(), Ok(Plaintext::Extracted(_))));
    }

    #[test]
    fn header_block_boundaries() {
        assert_eq!(None, header_block_len(b"Subject: x\r\n"));
        assert_eq!(Some(14), header_block_len(b"Subject: x\r\n\r\nbody"));
        assert_eq!(Some(12), header_block_len(b"Subject: x\n\nbody"));
        assert_eq!(Some(2), header_block_len(b"\r\nbody"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn sign_encrypt_round_trip_is_exact(
            body in "(?s).{0,200}",
            attachments in prop::collection::vec(
                (
                    "[a-zA-Z0-9äöü_.-]{1,16}",
                    prop::collection::vec(any::<u8>(), 0..300),
                ),
                0..3,
            ),
        ) {
            let (context, _, _) = test_context(keys());
            let outgoing = attachments
                .iter()
                .map(|(name, data)| OutgoingAttachment {
                    filename: name.clone(),
                    content_type: "application/octet-stream".to_owned(),
                    content_id: None,
                    data: data.clone(),
                })
                .collect::<Vec<_>>();

            let message = protect(&context, true, true, false, &body, outgoing);
            let result = parse(&context, message).unwrap();

            prop_assert_eq!(
                Some(body.as_str()),
                result.body.as_ref().map(|b| b.text.as_str())
            );
            prop_assert_eq!(None, result.html_body);
            prop_assert_eq!(attachments.len(), result.attachments.len());
            for ((name, data), extracted) in
                attachments.iter().zip(&result.attachments)
            {
                prop_assert_eq!(name, &extracted.display_name);
                prop_assert_eq!(data, &extracted.data);
            }
            prop_assert!(result.verify.unwrap().has_good_signature());
        }
    }

    #[test]
    fn unprotected_kinds_are_refused() {
        let (context, _, _) = test_context(keys());
        let failure = parse(&context, b"Subject: hi\r\n\r\nhi\r\n".to_vec())
            .unwrap_err();
        assert_matches!(Error::StateMismatch(_), failure.error);
    }

    #[test]
    fn error_text_mentions_signature_time() {
        let verify = VerifyResult {
            signatures: vec![Signature {
                fingerprint: "AAAA0001".to_owned(),
                summary: Summary::RED,
                validity: Validity::Unknown,
                status: Some("Bad signature".to_owned()),
                creation_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()),
                ..Signature::default()
            }],
            error: None,
        };

        let text = format_error_text(
            EnvelopeKind::PgpSigned,
            &Error::ParserAnomaly("broken".to_owned()),
            Some(&verify),
        );
        assert_eq!(
            "Signature verification failed.\n\
             \n\
             The message is malformed: broken\n\
             \n\
             Signature by AAAA0001 made 2024-03-01 12:30:00 UTC: Bad signature\n",
            text
        );
    }
}
