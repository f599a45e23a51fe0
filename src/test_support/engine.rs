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

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use base64::Engine;
use chrono::prelude::*;
use tiny_keccak::{Hasher, Sha3};

use crate::engine::{
    CryptoEngine, DecryptResult, EngineError, Key, Protocol, SignMode,
    SignResult, Signature, Summary, VerifyResult,
};

const MESSAGE_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
const MESSAGE_END: &str = "-----END PGP MESSAGE-----";
const SIGNED_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

/// A `CryptoEngine` which "signs" with a SHA-3 digest tagged with the
/// signer's fingerprint and "encrypts" with base64.
pub struct FakeEngine {
    keys: Mutex<Vec<Key>>,
    next_failure: Mutex<Option<EngineError>>,
    panic_next: AtomicBool,
    omit_hash_algorithm: AtomicBool,
}

impl FakeEngine {
    pub fn new(keys: Vec<Key>) -> Self {
        FakeEngine {
            keys: Mutex::new(keys),
            next_failure: Mutex::new(None),
            panic_next: AtomicBool::new(false),
            omit_hash_algorithm: AtomicBool::new(false),
        }
    }

    /// Make the next operation fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.next_failure.lock().unwrap() =
            Some(EngineError::Failed(message.to_owned()));
    }

    /// Make the next operation report that the user cancelled.
    pub fn cancel_next(&self) {
        *self.next_failure.lock().unwrap() = Some(EngineError::Cancelled);
    }

    /// Make the next operation panic.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn omit_hash_algorithm(&self) {
        self.omit_hash_algorithm.store(true, Ordering::SeqCst);
    }

    /// Lose access to every secret key.
    pub fn forget_secrets(&self) {
        for key in self.keys.lock().unwrap().iter_mut() {
            key.has_secret = false;
        }
    }

    pub fn encrypt_to_vec(
        &self,
        protocol: Protocol,
        recipients: &[Key],
        data: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        self.encrypt(protocol, recipients, data, &mut out).unwrap();
        out
    }

    /// Decrypt the armored message found anywhere in `message`, e.g. inside
    /// a PGP/MIME envelope.
    pub fn decrypt_to_vec(&self, message: &[u8]) -> Result<Vec<u8>, EngineError> {
        let start = memchr::memmem::find(message, MESSAGE_BEGIN.as_bytes())
            .ok_or_else(|| EngineError::Failed("No data".to_owned()))?;
        let mut plaintext = Vec::new();
        self.decrypt_verify(
            Protocol::OpenPgp,
            &mut &message[start..],
            &mut plaintext,
        )?;
        Ok(plaintext)
    }

    fn check_failure(&self) -> Result<(), EngineError> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("engine exploded");
        }

        match self.next_failure.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn find_key(&self, fingerprint: &str) -> Option<Key> {
        self.keys
            .lock()
            .unwrap()
            .iter()
            .find(|k| k.fingerprint.eq_ignore_ascii_case(fingerprint))
            .cloned()
    }

    fn sign_result(&self) -> SignResult {
        SignResult {
            hash_algorithm: if self.omit_hash_algorithm.load(Ordering::SeqCst) {
                None
            } else {
                Some("SHA256".to_owned())
            },
        }
    }

    fn require_secret(&self, signer: &Key) -> Result<(), EngineError> {
        if self
            .find_key(&signer.fingerprint)
            .is_some_and(|k| k.has_secret)
        {
            Ok(())
        } else {
            Err(EngineError::Failed("No secret key".to_owned()))
        }
    }

    fn verify_line(&self, line: &str, data: &[u8]) -> Signature {
        let (fingerprint, hash) = line.split_once(':').unwrap_or((line, ""));
        let key = self.find_key(fingerprint);
        let mut sig = Signature {
            fingerprint: fingerprint.to_owned(),
            hash_algorithm: Some("SHA256".to_owned()),
            creation_time: Utc.timestamp_opt(1_700_000_000, 0).single(),
            ..Signature::default()
        };

        match key {
            None => {
                sig.summary = Summary::KEY_MISSING;
                sig.status = Some("No public key".to_owned());
            },
            Some(key) if hash != digest(data) => {
                sig.summary = Summary::RED;
                sig.status = Some("Bad signature".to_owned());
                sig.key = Some(key);
            },
            Some(key) => {
                sig.summary = Summary::VALID | Summary::GREEN;
                sig.validity = key.best_validity();
                sig.is_de_vs = true;
                sig.key = Some(key);
            },
        }

        sig
    }

    fn verify_text(&self, signature: &str, data: &[u8]) -> VerifyResult {
        match find_signature_line(signature) {
            Some(line) => VerifyResult {
                signatures: vec![self.verify_line(line, data)],
                error: None,
            },
            None => VerifyResult {
                signatures: vec![],
                error: Some("No signature found".to_owned()),
            },
        }
    }
}

impl CryptoEngine for FakeEngine {
    fn sign(
        &self,
        protocol: Protocol,
        signer: &Key,
        mode: SignMode,
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<SignResult, EngineError> {
        self.check_failure()?;
        self.require_secret(signer)?;

        let line = signature_line(signer, input);
        match (mode, protocol) {
            (SignMode::Clear, _) => {
                write!(
                    output,
                    "{SIGNED_BEGIN}\r\nHash: SHA256\r\n\r\n{}\r\n\
                     {SIGNATURE_BEGIN}\r\n{line}\r\n{SIGNATURE_END}\r\n",
                    String::from_utf8_lossy(input),
                )
                .unwrap();
            },
            (SignMode::Detached, Protocol::Smime) => {
                output.extend_from_slice(line.as_bytes());
            },
            (SignMode::Detached, _) => {
                write!(
                    output,
                    "{SIGNATURE_BEGIN}\r\n{line}\r\n{SIGNATURE_END}\r\n"
                )
                .unwrap();
            },
        }

        Ok(self.sign_result())
    }

    fn encrypt(
        &self,
        _protocol: Protocol,
        recipients: &[Key],
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<(), EngineError> {
        self.check_failure()?;
        write_armored(output, recipients, None, input);
        Ok(())
    }

    fn sign_and_encrypt(
        &self,
        _protocol: Protocol,
        signer: &Key,
        recipients: &[Key],
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<SignResult, EngineError> {
        self.check_failure()?;
        self.require_secret(signer)?;
        write_armored(
            output,
            recipients,
            Some(&signature_line(signer, input)),
            input,
        );
        Ok(self.sign_result())
    }

    fn decrypt_verify(
        &self,
        _protocol: Protocol,
        input: &mut dyn Read,
        plaintext: &mut dyn Write,
    ) -> Result<(DecryptResult, VerifyResult), EngineError> {
        self.check_failure()?;

        let mut text = String::new();
        input
            .read_to_string(&mut text)
            .map_err(|e| EngineError::Failed(e.to_string()))?;

        let mut lines = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .skip_while(|&l| MESSAGE_BEGIN != l);
        if lines.next().is_none() {
            return Err(EngineError::Failed("No data".to_owned()));
        }

        let mut recipients = Vec::<String>::new();
        let mut signed_by = None;
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            } else if let Some(to) = line.strip_prefix("To: ") {
                recipients.extend(
                    to.split(',').filter(|s| !s.is_empty()).map(str::to_owned),
                );
            } else if let Some(sig) = line.strip_prefix("Signed-By: ") {
                signed_by = Some(sig.to_owned());
            }
        }

        let payload = lines
            .take_while(|&l| MESSAGE_END != l)
            .collect::<String>();

        let keys = recipients
            .iter()
            .filter_map(|fpr| self.find_key(fpr))
            .collect::<Vec<_>>();
        if !keys.iter().any(|k| k.has_secret) {
            return Err(EngineError::Failed("No secret key".to_owned()));
        }

        let data = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| EngineError::Failed("Decryption failed".to_owned()))?;
        plaintext
            .write_all(&data)
            .map_err(|e| EngineError::Failed(e.to_string()))?;

        let decrypt = DecryptResult {
            recipient_key_ids: keys.iter().map(|k| k.key_id().to_owned()).collect(),
            is_de_vs: true,
        };
        let verify = VerifyResult {
            signatures: signed_by
                .map(|line| self.verify_line(&line, &data))
                .into_iter()
                .collect(),
            error: None,
        };
        Ok((decrypt, verify))
    }

    fn verify_detached(
        &self,
        _protocol: Protocol,
        signed_data: &[u8],
        signature: &[u8],
    ) -> Result<VerifyResult, EngineError> {
        self.check_failure()?;
        Ok(self.verify_text(&String::from_utf8_lossy(signature), signed_data))
    }

    fn verify_opaque(
        &self,
        _protocol: Protocol,
        input: &mut dyn Read,
        plaintext: &mut dyn Write,
    ) -> Result<VerifyResult, EngineError> {
        self.check_failure()?;

        let mut text = String::new();
        input
            .read_to_string(&mut text)
            .map_err(|e| EngineError::Failed(e.to_string()))?;

        let split = text.find(SIGNED_BEGIN).and_then(|start| {
            let rest = &text[start..];
            let body = &rest[rest.find("\r\n\r\n")? + 4..];
            let end = body.find(&format!("\r\n{SIGNATURE_BEGIN}"))?;
            Some((&body[..end], &body[end..]))
        });
        let Some((content, signature)) = split else {
            return Err(EngineError::Failed("Not a signed message".to_owned()));
        };

        plaintext
            .write_all(content.as_bytes())
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        Ok(self.verify_text(signature, content.as_bytes()))
    }

    fn list_keys(
        &self,
        protocol: Protocol,
        fingerprints: &[String],
    ) -> Result<Vec<Key>, EngineError> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .filter(|k| protocol == k.protocol)
            .filter(|k| {
                fingerprints
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(&k.fingerprint))
            })
            .cloned()
            .collect())
    }
}

fn digest(data: &[u8]) -> String {
    let mut hasher = Sha3::v256();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

fn signature_line(signer: &Key, data: &[u8]) -> String {
    format!("{}:{}", signer.fingerprint, digest(data))
}

/// Find the first `FPR:DIGEST` line in `text`.
fn find_signature_line(text: &str) -> Option<&str> {
    text.lines().map(|l| l.trim()).find(|l| {
        l.split_once(':').is_some_and(|(fpr, hash)| {
            !fpr.is_empty()
                && fpr.bytes().all(|b| b.is_ascii_alphanumeric())
                && 64 == hash.len()
                && hash.bytes().all(|b| b.is_ascii_hexdigit())
        })
    })
}

fn write_armored(
    output: &mut Vec<u8>,
    recipients: &[Key],
    signed_by: Option<&str>,
    data: &[u8],
) {
    let to = recipients
        .iter()
        .map(|k| &k.fingerprint[..])
        .collect::<Vec<_>>()
        .join(",");
    write!(output, "{MESSAGE_BEGIN}\r\nTo: {to}\r\n").unwrap();
    if let Some(line) = signed_by {
        write!(output, "Signed-By: {line}\r\n").unwrap();
    }
    output.extend_from_slice(b"\r\n");

    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    for chunk in encoded.as_bytes().chunks(64) {
        output.extend_from_slice(chunk);
        output.extend_from_slice(b"\r\n");
    }
    write!(output, "{MESSAGE_END}\r\n").unwrap();
}
