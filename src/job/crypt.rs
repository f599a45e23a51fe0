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

use std::mem;
use std::sync::Arc;

use log::{error, info, warn};

use super::JobContext;
use crate::engine::{CryptoEngine, Protocol, SignMode, SignResult};
use crate::mime::builder::{self, OutgoingAttachment};
use crate::mime::envelope;
use crate::resolver::{KeyResolver, ResolveRequest, ResolvedKeySet};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Everything needed to protect one outgoing message, copied out of the
/// host item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CryptRequest {
    pub sign: bool,
    pub encrypt: bool,
    /// Protect inline instead of as MIME, if possible.
    pub inline: bool,
    /// Use MIME even if `inline` is set.
    pub force_mime: bool,
    pub sender: String,
    pub recipients: Vec<String>,
    /// The protocol to restrict key resolution to, if any.
    pub protocol: Protocol,
    pub window: Option<u64>,
    pub body: String,
    pub attachments: Vec<OutgoingAttachment>,
}

/// The protected form of the message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// A complete MIME entity replacing the message content.
    Mime(Vec<u8>),
    /// Armored text replacing the message body.
    Inline(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CryptOutput {
    pub protocol: Protocol,
    pub envelope: Envelope,
    pub micalg: Option<String>,
}

/// One protect operation.
///
/// The steps are `collect_input`, `resolve_keys`, `run` and `finalize`, in
/// that order; `execute` runs them all. Nothing is handed to the host until
/// `finalize` returns, so a failure at any step leaves no trace.
pub struct CryptJob {
    request: CryptRequest,
    engine: Arc<dyn CryptoEngine>,
    resolver: Arc<KeyResolver>,
    log_prefix: LogPrefix,

    keys: ResolvedKeySet,
    inline: bool,
    input: Vec<u8>,
    signature: Vec<u8>,
    output: Vec<u8>,
    micalg: Option<String>,
}

impl CryptJob {
    pub fn new(
        request: CryptRequest,
        context: &JobContext,
        log_prefix: LogPrefix,
    ) -> Self {
        CryptJob {
            request,
            engine: Arc::clone(&context.engine),
            resolver: Arc::clone(&context.resolver),
            log_prefix,
            keys: ResolvedKeySet::default(),
            inline: false,
            input: Vec::new(),
            signature: Vec::new(),
            output: Vec::new(),
            micalg: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        if Protocol::Unknown == self.keys.protocol {
            self.request.protocol
        } else {
            self.keys.protocol
        }
    }

    /// Whether the message is protected inline.
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    /// The data to be protected.
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Serialise the body and attachments into the input buffer.
    ///
    /// Inline protection cannot carry attachments, so their presence
    /// silently selects MIME. S/MIME is always MIME.
    pub fn collect_input(&mut self) -> Result<(), Error> {
        self.inline = self.request.inline
            && !self.request.force_mime
            && Protocol::Smime != self.protocol();
        if self.inline && !self.request.attachments.is_empty() {
            info!(
                "{} Message has attachments; using MIME instead of inline",
                self.log_prefix,
            );
            self.inline = false;
        }

        self.input.clear();
        if self.inline {
            self.input.extend_from_slice(self.request.body.as_bytes());
        } else {
            builder::write_mime_tree(
                &mut self.input,
                &self.request.body,
                &self.request.attachments,
            )?;
        }

        Ok(())
    }

    pub fn resolve_keys(&mut self) -> Result<(), Error> {
        let request = ResolveRequest {
            sender: self.request.sender.clone(),
            recipients: self.request.recipients.clone(),
            sign: self.request.sign,
            encrypt: self.request.encrypt,
            protocol: self.request.protocol,
            window: self.request.window,
        };

        self.keys = self.resolver.resolve(&request, &self.log_prefix)?;
        self.log_prefix.set_protocol(self.keys.protocol.name());
        Ok(())
    }

    /// Use already-resolved keys instead of calling `resolve_keys`.
    pub fn set_keys(&mut self, keys: ResolvedKeySet) {
        self.log_prefix.set_protocol(keys.protocol.name());
        self.keys = keys;
    }

    /// Perform the engine operations.
    pub fn run(&mut self) -> Result<(), Error> {
        let protocol = self.keys.protocol;
        let (sign, encrypt) = (self.request.sign, self.request.encrypt);
        if !sign && !encrypt {
            return Err(Error::StateMismatch(
                "crypt job without sign or encrypt".to_owned(),
            ));
        }

        let signer = if sign {
            Some(self.keys.signer.as_ref().ok_or_else(|| {
                Error::KeyResolutionFailed("no signing key".to_owned())
            })?)
        } else {
            None
        };
        if encrypt && self.keys.recipients.is_empty() {
            return Err(Error::KeyResolutionFailed(
                "no recipient keys".to_owned(),
            ));
        }

        match (signer, encrypt, self.inline) {
            (Some(signer), true, true) => {
                self.engine.sign_and_encrypt(
                    protocol,
                    signer,
                    &self.keys.recipients,
                    &self.input,
                    &mut self.output,
                )?;
            },

            (Some(signer), true, false) => {
                let result = self.engine.sign(
                    protocol,
                    signer,
                    SignMode::Detached,
                    &self.input,
                    &mut self.signature,
                )?;
                let micalg = micalg_of(protocol, &result)?;

                let mut signed = Vec::new();
                envelope::write_signed(
                    &mut signed,
                    protocol,
                    &micalg,
                    &self.input,
                    &self.signature,
                )?;
                self.micalg = Some(micalg);
                // Only the wrapped form is needed from here on
                self.input = Vec::new();
                self.signature = Vec::new();

                self.engine.encrypt(
                    protocol,
                    &self.keys.recipients,
                    &signed,
                    &mut self.output,
                )?;
            },

            (None, _, _) => {
                self.engine.encrypt(
                    protocol,
                    &self.keys.recipients,
                    &self.input,
                    &mut self.output,
                )?;
            },

            (Some(signer), false, true) => {
                self.engine.sign(
                    protocol,
                    signer,
                    SignMode::Clear,
                    &self.input,
                    &mut self.output,
                )?;
            },

            (Some(signer), false, false) => {
                let result = self.engine.sign(
                    protocol,
                    signer,
                    SignMode::Detached,
                    &self.input,
                    &mut self.signature,
                )?;
                self.micalg = Some(micalg_of(protocol, &result)?);
            },
        }

        Ok(())
    }

    /// Build the final envelope.
    pub fn finalize(&mut self) -> Result<CryptOutput, Error> {
        let protocol = self.keys.protocol;
        let envelope = if self.inline {
            let text = String::from_utf8(mem::take(&mut self.output))
                .map_err(|_| {
                    Error::EnvelopeBuildFailed(
                        "inline output is not text".to_owned(),
                    )
                })?;
            Envelope::Inline(text)
        } else if self.request.encrypt {
            let mut out = Vec::new();
            envelope::write_encrypted(&mut out, protocol, &self.output)?;
            Envelope::Mime(out)
        } else {
            let micalg = self.micalg.as_deref().ok_or_else(|| {
                Error::StateMismatch("finalize before run".to_owned())
            })?;
            let mut out = Vec::new();
            envelope::write_signed(
                &mut out,
                protocol,
                micalg,
                &self.input,
                &self.signature,
            )?;
            Envelope::Mime(out)
        };

        Ok(CryptOutput {
            protocol,
            envelope,
            micalg: self.micalg.clone(),
        })
    }

    /// Run every step of the job.
    pub fn execute(mut self) -> Result<CryptOutput, Error> {
        let result = self.execute_steps();
        match result {
            Ok(ref output) => info!(
                "{} Protected message ({}, {})",
                self.log_prefix,
                output.protocol,
                if self.inline { "inline" } else { "MIME" },
            ),
            Err(ref e) if e.is_cancellation() => {
                info!("{} Protection cancelled by user", self.log_prefix)
            },
            Err(ref e) => {
                error!("{} Protection failed: {}", self.log_prefix, e)
            },
        }
        result
    }

    fn execute_steps(&mut self) -> Result<CryptOutput, Error> {
        self.collect_input()?;
        self.resolve_keys()?;
        if self.inline && Protocol::Smime == self.keys.protocol {
            warn!("{} S/MIME selected; using MIME", self.log_prefix);
            self.collect_input()?;
        }
        self.run()?;
        self.finalize()
    }
}

/// The `micalg` parameter for the signature described by `result`.
fn micalg_of(protocol: Protocol, result: &SignResult) -> Result<String, Error> {
    result
        .hash_algorithm
        .as_deref()
        .map(|hash| envelope::micalg(protocol, hash))
        .ok_or_else(|| {
            Error::EngineOperationFailed(
                "engine did not report the hash algorithm".to_owned(),
            )
        })
}
