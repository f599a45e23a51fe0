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

//! The contract with the external crypto engine.
//!
//! Sealpost never performs public-key cryptography itself. Everything here
//! describes what it asks of the engine and the structured results it gets
//! back; the actual implementation is supplied by the host integration.

use std::fmt;
use std::io::{Read, Write};

use bitflags::bitflags;
use chrono::prelude::*;
use thiserror::Error;

pub mod keycache;

/// The cryptographic protocol of a key or operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    OpenPgp,
    Smime,
    /// Not decided yet; the key resolver fixes it.
    #[default]
    Unknown,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::OpenPgp => "openpgp",
            Protocol::Smime => "smime",
            Protocol::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How much a key or user id is trusted, in increasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Validity {
    #[default]
    Unknown,
    Undefined,
    Never,
    Marginal,
    Full,
    Ultimate,
}

/// Where the engine got a key from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum KeyOrigin {
    #[default]
    Unknown,
    KeyServer,
    Dane,
    /// The Web Key Directory of the address's domain.
    Wkd,
    Url,
    File,
    SelfCreated,
}

/// A certification of a user id by some key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidSignature {
    /// The long key id of the certifying key.
    pub signer_key_id: String,
    /// The user id string of the certifying key the certification was made
    /// under.
    pub signer_uid: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TofuPolicy {
    #[default]
    None,
    Auto,
    Good,
    Unknown,
    Bad,
    /// The engine has seen conflicting keys for the binding and wants the
    /// user to decide.
    Ask,
}

/// How much trust-on-first-use history exists for a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TofuHistory {
    None,
    Little,
    Basic,
    Large,
}

/// Messages needed before a binding has basic history.
const TOFU_BASIC_THRESHOLD: u32 = 10;
/// Messages needed before a binding has large history.
const TOFU_LARGE_THRESHOLD: u32 = 100;

/// Trust-on-first-use statistics for one user id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TofuInfo {
    /// The number of verified signatures seen from this binding.
    pub sign_count: u32,
    /// The number of messages encrypted to this binding.
    pub encr_count: u32,
    pub policy: TofuPolicy,
}

impl TofuInfo {
    pub fn history(&self) -> TofuHistory {
        match self.sign_count.saturating_add(self.encr_count) {
            0 => TofuHistory::None,
            n if n < TOFU_BASIC_THRESHOLD => TofuHistory::Little,
            n if n < TOFU_LARGE_THRESHOLD => TofuHistory::Basic,
            _ => TofuHistory::Large,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.policy, TofuPolicy::Ask | TofuPolicy::Bad)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UserId {
    /// The full user id, e.g. `Alice <alice@example.org>`.
    pub uid: String,
    /// The bare address part of `uid`.
    pub addr: String,
    pub validity: Validity,
    pub signatures: Vec<UidSignature>,
    pub tofu: Option<TofuInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Key {
    pub fingerprint: String,
    pub protocol: Protocol,
    pub user_ids: Vec<UserId>,
    /// Whether the secret part of the key is available to the engine.
    pub has_secret: bool,
    pub can_sign: bool,
    pub can_encrypt: bool,
    pub origin: KeyOrigin,
}

impl Key {
    /// The long (16 hex digit) key id, derived from the fingerprint.
    pub fn key_id(&self) -> &str {
        let start = self.fingerprint.len().saturating_sub(16);
        self.fingerprint.get(start..).unwrap_or(&self.fingerprint)
    }

    /// Whether `key_id` (of any length) identifies this key.
    pub fn matches_key_id(&self, key_id: &str) -> bool {
        let Some(start) = self.fingerprint.len().checked_sub(key_id.len())
        else {
            return false;
        };

        !key_id.is_empty()
            && self
                .fingerprint
                .get(start..)
                .is_some_and(|tail| tail.eq_ignore_ascii_case(key_id))
    }

    /// Find the user id bound to `addr`, ignoring case.
    pub fn user_id_for(&self, addr: &str) -> Option<&UserId> {
        self.user_ids
            .iter()
            .find(|u| u.addr.eq_ignore_ascii_case(addr))
    }

    /// The best validity of any of the key's user ids.
    pub fn best_validity(&self) -> Validity {
        self.user_ids
            .iter()
            .map(|u| u.validity)
            .max()
            .unwrap_or_default()
    }
}

bitflags! {
    /// The engine's summary of a signature's status.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Summary: u32 {
        const VALID = 1 << 0;
        const GREEN = 1 << 1;
        const RED = 1 << 2;
        const KEY_REVOKED = 1 << 3;
        const KEY_EXPIRED = 1 << 4;
        const SIG_EXPIRED = 1 << 5;
        const KEY_MISSING = 1 << 6;
        const CRL_MISSING = 1 << 7;
        const CRL_TOO_OLD = 1 << 8;
        const BAD_POLICY = 1 << 9;
        const SYS_ERROR = 1 << 10;
        const TOFU_CONFLICT = 1 << 11;
    }
}

/// One signature found while verifying.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Signature {
    /// The fingerprint (or, if the key is missing, the key id) of the signer.
    pub fingerprint: String,
    pub summary: Summary,
    pub validity: Validity,
    /// The engine's diagnostic if the signature did not verify.
    pub status: Option<String>,
    pub hash_algorithm: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    /// Whether the signature complies with the German VS-NfD rules.
    pub is_de_vs: bool,
    /// The full signing key, filled in after verification.
    pub key: Option<Key>,
}

impl Signature {
    /// Whether the signature is cryptographically broken, as opposed to
    /// merely untrusted.
    pub fn is_bad(&self) -> bool {
        self.status.is_some()
            || self.summary.intersects(
                Summary::RED | Summary::KEY_REVOKED | Summary::SYS_ERROR,
            )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VerifyResult {
    pub signatures: Vec<Signature>,
    /// Set if verification as a whole failed, in which case `signatures` is
    /// usually empty.
    pub error: Option<String>,
}

impl VerifyResult {
    pub fn has_good_signature(&self) -> bool {
        self.signatures.iter().any(|s| !s.is_bad())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DecryptResult {
    /// The key ids the message was encrypted to.
    pub recipient_key_ids: Vec<String>,
    pub is_de_vs: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SignResult {
    /// The name of the hash algorithm used, e.g. `SHA256`.
    pub hash_algorithm: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignMode {
    /// A detached signature, for multipart/signed.
    Detached,
    /// A clear-signed text, for inline protection.
    Clear,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// The crypto engine.
///
/// Implementations may block for an arbitrary amount of time, for example
/// while the engine prompts for a passphrase, and so are only ever called
/// from background threads.
pub trait CryptoEngine: Send + Sync {
    fn sign(
        &self,
        protocol: Protocol,
        signer: &Key,
        mode: SignMode,
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<SignResult, EngineError>;

    fn encrypt(
        &self,
        protocol: Protocol,
        recipients: &[Key],
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<(), EngineError>;

    /// Sign and encrypt in one pass, producing a single combined blob.
    fn sign_and_encrypt(
        &self,
        protocol: Protocol,
        signer: &Key,
        recipients: &[Key],
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<SignResult, EngineError>;

    /// Decrypt `input`, verifying any signature inside, and stream the
    /// plaintext to `plaintext` as it becomes available.
    fn decrypt_verify(
        &self,
        protocol: Protocol,
        input: &mut dyn Read,
        plaintext: &mut dyn Write,
    ) -> Result<(DecryptResult, VerifyResult), EngineError>;

    fn verify_detached(
        &self,
        protocol: Protocol,
        signed_data: &[u8],
        signature: &[u8],
    ) -> Result<VerifyResult, EngineError>;

    /// Verify a signature which wraps its content (clear-signed text or an
    /// opaque S/MIME signature), streaming the content to `plaintext`.
    fn verify_opaque(
        &self,
        protocol: Protocol,
        input: &mut dyn Read,
        plaintext: &mut dyn Write,
    ) -> Result<VerifyResult, EngineError>;

    /// Look up full keys by fingerprint. Fingerprints which match nothing
    /// are silently omitted from the result.
    fn list_keys(
        &self,
        protocol: Protocol,
        fingerprints: &[String],
    ) -> Result<Vec<Key>, EngineError>;
}
