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

//! The per-message orchestration of protection and unprotection.
//!
//! A `Message` reacts to the events of one host mail item. Outgoing
//! messages move through `CryptState` as the host saves and sends them;
//! incoming ones move through `InboundState` as they are read. Messages
//! never start background work themselves: event handlers return a
//! `Followup` which the `Session` acts on once the message is unlocked,
//! and results come back through `crypt_done` and `parse_done`.

use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;

use self::display::{error_html, is_html_body, WAIT_TEMPLATE, WIPE_TEMPLATE};
use self::host::MailItem;
use self::state::{CryptState, InboundState, ProtectionFlags};
use crate::engine::{DecryptResult, Protocol, Signature, VerifyResult};
use crate::job::crypt::{CryptJob, CryptOutput, CryptRequest, Envelope};
use crate::job::parse::{ParseFailure, ParseJob, ParseResult};
use crate::job::JobContext;
use crate::mime::kind::{self, EnvelopeKind};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::CryptoConfig;

pub mod display;
pub mod host;
pub mod registry;
pub mod session;
pub mod state;
pub mod trust;

/// Properties Sealpost writes itself. Change events for them are noise.
const OWN_PROPERTIES: &[&str] = &[
    "Body",
    "HTMLBody",
    "To",
    "CC",
    "BCC",
    "Categories",
    "UnRead",
    "OutlookVersion",
    "OutlookInternalVersion",
];

/// What the host should do with the event that was just handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResponse {
    Proceed,
    /// Abort the host's default action (the save or send).
    Cancel,
}

/// Background work a message wants started.
pub enum Followup {
    None,
    StartParse(Arc<ParseJob>),
    StartCrypt { uid: String, job: CryptJob },
}

pub struct Message {
    item: Box<dyn MailItem>,
    uid: String,
    log_prefix: LogPrefix,

    crypt_state: CryptState,
    /// Whether the current crypt job runs in the background.
    async_crypt: bool,
    force_mime: bool,
    /// The result of a background crypt job, until the second save stores
    /// it.
    crypt_output: Option<CryptOutput>,
    cached_sender: String,
    cached_recipients: Vec<String>,

    kind: EnvelopeKind,
    inbound: InboundState,
    is_decrypted: bool,
    is_signed: bool,
    trust_level: u8,
    signature: Option<Signature>,
    decrypt_result: Option<DecryptResult>,
    verify_result: Option<VerifyResult>,
    /// The item shows content that must not be persisted.
    needs_wipe: bool,
    /// A save of the item should go through (after wiping) rather than be
    /// refused.
    needs_save: bool,
    original_body: Option<String>,
    original_html: Option<String>,
}

impl Message {
    /// Take over `item`, giving it a uid if it has none yet.
    pub fn new(mut item: Box<dyn MailItem>) -> Result<Self, Error> {
        let uid = match item.uid() {
            Some(uid) if !uid.is_empty() => uid,
            _ => {
                let uid = generate_uid();
                item.set_uid(&uid)?;
                uid
            },
        };

        let log_prefix = LogPrefix::new("msg");
        log_prefix.set_uid(&uid);

        Ok(Message {
            item,
            uid,
            log_prefix,
            crypt_state: CryptState::NoCryptMail,
            async_crypt: false,
            force_mime: false,
            crypt_output: None,
            cached_sender: String::new(),
            cached_recipients: Vec::new(),
            kind: EnvelopeKind::None,
            inbound: InboundState::Unprocessed,
            is_decrypted: false,
            is_signed: false,
            trust_level: 0,
            signature: None,
            decrypt_result: None,
            verify_result: None,
            needs_wipe: false,
            needs_save: false,
            original_body: None,
            original_html: None,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Switch to a fresh uid for the rest of this session, without
    /// persisting it, because another live message already uses the
    /// persisted one.
    pub fn reassign_uid(&mut self) {
        self.uid = generate_uid();
        self.log_prefix.set_uid(&self.uid);
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub fn crypt_state(&self) -> CryptState {
        self.crypt_state
    }

    pub fn inbound_state(&self) -> InboundState {
        self.inbound
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn is_crypto_mail(&self) -> bool {
        self.kind.is_crypto()
    }

    pub fn is_smime(&self) -> bool {
        self.kind.is_smime()
    }

    pub fn is_decrypted(&self) -> bool {
        self.is_decrypted
    }

    /// Whether the message carries a signature that verified.
    pub fn is_signed(&self) -> bool {
        self.is_signed
    }

    pub fn trust_level(&self) -> u8 {
        self.trust_level
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn decrypt_result(&self) -> Option<&DecryptResult> {
        self.decrypt_result.as_ref()
    }

    pub fn verify_result(&self) -> Option<&VerifyResult> {
        self.verify_result.as_ref()
    }

    pub fn needs_wipe(&self) -> bool {
        self.needs_wipe
    }

    pub fn crypto_summary(&self) -> String {
        trust::crypto_summary(self.trust_level, self.is_signed, self.is_decrypted)
    }

    /// The trust category to show for the message, if any.
    pub fn trust_category(&self) -> Option<String> {
        (self.is_signed && self.trust_level > 0)
            .then(|| trust::trust_category(self.trust_level))
    }

    /// The protection a reply to or forward of this message should get.
    pub fn crypto_flags(&self) -> ProtectionFlags {
        let mut flags = ProtectionFlags::empty();
        flags.set(ProtectionFlags::ENCRYPT, self.is_decrypted);
        flags.set(ProtectionFlags::SIGN, self.is_signed);
        flags
    }

    /// The protection the user wants for this draft.
    pub fn protection_flags(&self) -> ProtectionFlags {
        self.item.protection_flags().unwrap_or_default()
    }

    pub fn set_protection_flags(
        &mut self,
        flags: ProtectionFlags,
    ) -> Result<(), Error> {
        debug!("{} Protection flags set to {:?}", self.log_prefix, flags);
        self.item.set_protection_flags(flags)
    }

    /// Always protect as MIME, even if inline protection is configured.
    pub fn set_force_mime(&mut self, force_mime: bool) {
        self.force_mime = force_mime;
    }

    /// Seed the protection flags of a draft from the configured defaults,
    /// unless it already has flags of its own.
    pub fn on_open(&mut self, config: &CryptoConfig) -> Result<(), Error> {
        if self.kind.is_crypto() || self.item.protection_flags().is_some() {
            return Ok(());
        }

        let mut flags = ProtectionFlags::empty();
        flags.set(ProtectionFlags::SIGN, config.sign_default);
        flags.set(ProtectionFlags::ENCRYPT, config.encrypt_default);
        if flags.is_empty() {
            return Ok(());
        }

        self.set_protection_flags(flags)
    }

    pub fn on_send(&mut self) -> EventResponse {
        match self.crypt_state {
            state if state.wants_send() => {
                info!("{} Sending protected message", self.log_prefix);
                EventResponse::Proceed
            },

            CryptState::NoCryptMail => {
                if self.protection_flags().is_empty() {
                    return EventResponse::Proceed;
                }

                // The item must be saved before it can be protected; the
                // send is retried once protection is done.
                if let Err(e) = self.cache_addresses() {
                    self.abort_crypt(e);
                    return EventResponse::Cancel;
                }
                self.transition(CryptState::NeedsFirstAfterWrite);
                if let Err(e) = self.item.request_save() {
                    self.abort_crypt(e);
                }
                EventResponse::Cancel
            },

            state => {
                debug!(
                    "{} Send refused while protecting ({:?})",
                    self.log_prefix, state,
                );
                EventResponse::Cancel
            },
        }
    }

    pub fn on_before_write(&mut self) -> EventResponse {
        if InboundState::Pending == self.inbound {
            debug!("{} Save refused while parsing", self.log_prefix);
            return EventResponse::Cancel;
        }

        if self.needs_wipe {
            if !self.needs_save {
                debug!("{} Save of unprotected content refused", self.log_prefix);
                return EventResponse::Cancel;
            }

            self.needs_save = false;
            if let Err(e) = self.wipe() {
                error!("{} Failed to wipe before saving: {}", self.log_prefix, e);
                return EventResponse::Cancel;
            }
        }

        EventResponse::Proceed
    }

    pub fn on_after_write(&mut self, context: &JobContext) -> Followup {
        match self.crypt_state {
            CryptState::NeedsFirstAfterWrite => {
                self.transition(CryptState::NeedsActualCrypt);
                let job = match self.start_crypt(context) {
                    Ok(job) => job,
                    Err(e) => {
                        self.abort_crypt(e);
                        return Followup::None;
                    },
                };

                self.async_crypt = context.config.crypto.async_crypto;
                if self.async_crypt {
                    Followup::StartCrypt {
                        uid: self.uid.clone(),
                        job,
                    }
                } else {
                    let result = job.execute();
                    self.crypt_done(result);
                    Followup::None
                }
            },

            CryptState::NeedsSecondAfterWrite => {
                if let Err(e) = self.store_envelope() {
                    self.abort_crypt(e);
                }
                Followup::None
            },

            _ => Followup::None,
        }
    }

    /// Create the crypt job for the current content of the item.
    pub fn start_crypt(&mut self, context: &JobContext) -> Result<CryptJob, Error> {
        if CryptState::NeedsActualCrypt != self.crypt_state {
            error!(
                "{} Crypt job requested in state {:?}",
                self.log_prefix, self.crypt_state,
            );
            return Err(Error::StateMismatch(format!(
                "crypt job requested in state {:?}",
                self.crypt_state,
            )));
        }

        let flags = self.protection_flags();
        let config = &context.config.crypto;
        let request = CryptRequest {
            sign: flags.contains(ProtectionFlags::SIGN),
            encrypt: flags.contains(ProtectionFlags::ENCRYPT),
            inline: config.inline_pgp,
            force_mime: self.force_mime,
            sender: self.cached_sender.clone(),
            recipients: self.cached_recipients.clone(),
            protocol: if config.enable_smime {
                Protocol::Unknown
            } else {
                Protocol::OpenPgp
            },
            window: self.item.window(),
            body: self.item.body()?,
            attachments: self.item.attachments()?,
        };

        Ok(CryptJob::new(request, context, self.log_prefix.clone()))
    }

    /// Apply the result of the crypt job.
    pub fn crypt_done(&mut self, result: Result<CryptOutput, Error>) {
        if CryptState::NeedsActualCrypt != self.crypt_state {
            error!(
                "{} Crypt result arrived in state {:?}; discarded",
                self.log_prefix, self.crypt_state,
            );
            return;
        }

        let output = match result {
            Ok(output) => output,
            Err(e) => return self.abort_crypt(e),
        };

        self.log_prefix.set_protocol(output.protocol.name());
        let applied = if self.async_crypt {
            self.apply_async(output)
        } else {
            self.apply_sync(output)
        };

        if let Err(e) = applied {
            self.abort_crypt(e);
        }
    }

    fn apply_sync(&mut self, output: CryptOutput) -> Result<(), Error> {
        self.transition(CryptState::NeedsUpdateInMapi);
        self.update_mapi(&output)?;
        self.transition(CryptState::NeedsUpdateInOom);
        self.update_oom(&output)?;
        self.transition(wants_send(&output));
        self.item.request_send()
    }

    fn apply_async(&mut self, output: CryptOutput) -> Result<(), Error> {
        self.transition(CryptState::NeedsUpdateInOom);
        self.update_oom(&output)?;
        self.crypt_output = Some(output);
        self.transition(CryptState::NeedsSecondAfterWrite);
        self.item.request_save()
    }

    fn store_envelope(&mut self) -> Result<(), Error> {
        let output = self.crypt_output.take().ok_or_else(|| {
            Error::StateMismatch("no protected content to store".to_owned())
        })?;

        self.transition(CryptState::NeedsUpdateInMapi);
        self.update_mapi(&output)?;
        self.transition(wants_send(&output));
        self.item.request_send()
    }

    fn update_mapi(&mut self, output: &CryptOutput) -> Result<(), Error> {
        if let Envelope::Mime(ref envelope) = output.envelope {
            self.item.set_envelope(envelope)?;
        }
        Ok(())
    }

    fn update_oom(&mut self, output: &CryptOutput) -> Result<(), Error> {
        if let Envelope::Inline(ref text) = output.envelope {
            self.item.set_body(text)?;
        }
        Ok(())
    }

    fn cache_addresses(&mut self) -> Result<(), Error> {
        self.cached_sender = [
            self.item.sending_account_address(),
            self.item.sender_address(),
            self.item.current_user_address(),
        ]
        .into_iter()
        .flatten()
        .find(|addr| !addr.is_empty())
        .ok_or_else(|| {
            Error::KeyResolutionFailed("no sender address".to_owned())
        })?;
        self.cached_recipients = self.item.recipients()?;
        Ok(())
    }

    fn abort_crypt(&mut self, error: Error) {
        if error.is_cancellation() {
            info!("{} Protection cancelled", self.log_prefix);
        } else {
            error!("{} Protection failed: {}", self.log_prefix, error);
            self.item.report_error(&error);
        }

        self.crypt_output = None;
        self.transition(CryptState::NoCryptMail);
    }

    fn transition(&mut self, next: CryptState) {
        if !self.crypt_state.can_become(next) {
            error!(
                "{} Illegal transition {:?} -> {:?}",
                self.log_prefix, self.crypt_state, next,
            );
        }

        debug!("{} {:?} -> {:?}", self.log_prefix, self.crypt_state, next);
        self.crypt_state = next;
    }

    /// Classify the item, if that hasn't happened yet.
    pub fn on_before_read(&mut self) -> Result<(), Error> {
        if InboundState::Unprocessed != self.inbound {
            return Ok(());
        }

        let source = self.item.mime_source()?;
        self.kind = kind::classify(&source[..])?;
        debug!("{} Classified as {:?}", self.log_prefix, self.kind);
        Ok(())
    }

    /// Start unprotecting the item if it is protected and not already being
    /// (or been) unprotected.
    pub fn on_read(&mut self, context: &JobContext) -> Followup {
        if !self.kind.is_crypto() {
            return Followup::None;
        }

        if InboundState::Unprocessed != self.inbound || self.needs_wipe {
            debug!(
                "{} Read while {:?}; nothing to do",
                self.log_prefix, self.inbound,
            );
            return Followup::None;
        }

        let source = match self.item.mime_source() {
            Ok(source) => source,
            Err(e) => {
                warn!("{} Cannot read message source: {}", self.log_prefix, e);
                return Followup::None;
            },
        };

        self.original_body = self.item.body().ok();
        self.original_html = self.item.html_body().ok().flatten();
        if let Err(e) = self.item.set_html_body(WAIT_TEMPLATE) {
            warn!("{} Failed to show placeholder: {}", self.log_prefix, e);
        }

        if self.kind.is_smime() && !context.config.crypto.enable_smime {
            self.needs_save = true;
        }

        self.inbound = InboundState::Pending;
        Followup::StartParse(Arc::new(ParseJob::new(
            self.uid.clone(),
            self.kind,
            source,
            context,
            self.log_prefix.clone(),
        )))
    }

    /// Apply the result of the parse job.
    pub fn parse_done(
        &mut self,
        outcome: Result<ParseResult, ParseFailure>,
        context: &JobContext,
    ) {
        if InboundState::Pending != self.inbound {
            warn!(
                "{} Parse result arrived in state {:?}; discarded",
                self.log_prefix, self.inbound,
            );
            return;
        }

        self.inbound = InboundState::Processed;
        match outcome {
            Ok(result) => self.show_result(result, context),
            Err(failure) => self.show_failure(failure),
        }
    }

    fn show_result(&mut self, result: ParseResult, context: &JobContext) {
        let ultimate_keys = context.cache.ultimate_keys();
        let sender = self.item.sender_address();

        self.is_decrypted = result.decrypt.is_some();
        self.signature = result
            .verify
            .as_ref()
            .and_then(|v| v.signatures.first().cloned());
        self.is_signed = self.signature.as_ref().is_some_and(|s| !s.is_bad());
        self.trust_level = self.signature.as_ref().map_or(0, |sig| {
            trust::signature_level(sig, sender.as_deref(), &ultimate_keys)
        });
        self.decrypt_result = result.decrypt;
        self.verify_result = result.verify;

        let shown = match (result.html_body, result.body) {
            (Some(html), _) => self.item.set_html_body(&html.text),
            (None, Some(body)) if is_html_body(&body.text) => {
                self.item.set_html_body(&body.text)
            },
            (None, Some(body)) => self.item.set_body(&body.text),
            (None, None) => self.item.set_body(""),
        };
        if let Err(e) = shown {
            error!("{} Failed to show content: {}", self.log_prefix, e);
            self.restore_original();
            return;
        }
        self.needs_wipe = true;

        if !result.attachments.is_empty() {
            if let Err(e) = self.item.add_attachments(&result.attachments) {
                warn!("{} Failed to add attachments: {}", self.log_prefix, e);
            }
        }

        let category = self.trust_category();
        if let Err(e) = self.item.set_trust_category(category.as_deref()) {
            warn!("{} Failed to set category: {}", self.log_prefix, e);
        }

        info!("{} Processed: {}", self.log_prefix, self.crypto_summary());
    }

    fn show_failure(&mut self, failure: ParseFailure) {
        let ParseFailure { error, text } = failure;

        if error.is_cancellation() {
            info!("{} Unprotecting cancelled", self.log_prefix);
            self.restore_original();
            return;
        }

        if !self.kind.is_encrypted() {
            // Verification failed outright; the original content is still
            // the best thing to show.
            self.item.report_error(&error);
            self.restore_original();
            return;
        }

        match self.item.set_html_body(&error_html(&text)) {
            Ok(()) => self.needs_wipe = true,
            Err(e) => {
                error!("{} Failed to show error: {}", self.log_prefix, e);
                self.restore_original();
            },
        }
    }

    /// Put back the body shown before parsing, or if that's impossible,
    /// wipe.
    fn restore_original(&mut self) {
        let restored = match (self.original_html.take(), self.original_body.take())
        {
            (Some(html), _) => self.item.set_html_body(&html),
            (None, Some(body)) => self.item.set_body(&body),
            (None, None) => Err(Error::StateMismatch(
                "original body unknown".to_owned(),
            )),
        };

        match restored {
            Ok(()) => self.needs_wipe = false,
            Err(e) => {
                warn!(
                    "{} Cannot restore original body ({}); wiping",
                    self.log_prefix, e,
                );
                self.needs_wipe = true;
                if let Err(e) = self.wipe() {
                    error!("{} Failed to wipe: {}", self.log_prefix, e);
                }
            },
        }
    }

    pub fn on_close(&mut self) {
        if let Err(e) = self.wipe() {
            error!("{} Failed to wipe on close: {}", self.log_prefix, e);
        }
    }

    pub fn on_property_change(&self, name: &str) {
        if OWN_PROPERTIES.contains(&name) {
            trace!("{} Ignoring change of {}", self.log_prefix, name);
        } else if InboundState::Processed == self.inbound {
            debug!("{} Property {} changed", self.log_prefix, name);
        }
    }

    /// Replace unprotected content shown by the item with a notice.
    ///
    /// Does nothing if nothing needs wiping.
    pub fn wipe(&mut self) -> Result<(), Error> {
        if !self.needs_wipe {
            return Ok(());
        }

        self.item.set_html_body(WIPE_TEMPLATE)?;
        self.needs_wipe = false;
        debug!("{} Wiped", self.log_prefix);
        Ok(())
    }

    /// Return a processed message to the state it was in before it was
    /// read.
    pub fn revert(&mut self) -> Result<(), Error> {
        if InboundState::Unprocessed == self.inbound {
            return Ok(());
        }

        if self.needs_wipe || InboundState::Pending == self.inbound {
            self.restore_original();
        }
        self.wipe()?;
        self.inbound = InboundState::Unprocessed;
        Ok(())
    }
}

fn wants_send(output: &CryptOutput) -> CryptState {
    match output.envelope {
        Envelope::Mime(_) => CryptState::WantsSendMime,
        Envelope::Inline(_) => CryptState::WantsSendInline,
    }
}

fn generate_uid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Validity;
    use crate::mime::extract::TextBody;
    use crate::support::system_config::SystemConfig;
    use crate::test_support::{
        test_context_with_config, test_key, FakeMailItem,
    };

    const SMIME_SOURCE: &[u8] = b"Content-Type: application/pkcs7-mime; \
                                  smime-type=enveloped-data\r\n\r\nMIAG\r\n";
    const SIGNED_SOURCE: &[u8] =
        b"Content-Type: multipart/signed; \
          protocol=\"application/pgp-signature\"; boundary=x\r\n\r\n";

    fn context(config: SystemConfig) -> JobContext {
        test_context_with_config(
            vec![
                test_key("AAAA0001", "a@example.org", Validity::Ultimate, true),
                test_key("BBBB0002", "b@example.org", Validity::Full, true),
            ],
            config,
        )
        .0
    }

    fn message(item: &FakeMailItem) -> Message {
        Message::new(Box::new(item.clone())).unwrap()
    }

    fn text(text: &str) -> Option<TextBody> {
        Some(TextBody {
            text: text.to_owned(),
            charset: "utf-8".to_owned(),
        })
    }

    fn read(message: &mut Message, context: &JobContext) {
        message.on_before_read().unwrap();
        assert!(matches!(
            message.on_read(context),
            Followup::StartParse(_)
        ));
        assert_eq!(InboundState::Pending, message.inbound_state());
    }

    #[test]
    fn uid_assigned_once() {
        let item = FakeMailItem::new();
        let uid = message(&item).uid().to_owned();
        assert_eq!(24, uid.len());
        assert!(uid.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(Some(uid.clone()), item.state().uid);
        assert_eq!(uid, message(&item).uid());
    }

    #[test]
    fn crypt_job_only_when_requested() {
        let context = context(SystemConfig::default());
        let item = FakeMailItem::new();
        let mut message = message(&item);
        assert!(matches!(
            message.start_crypt(&context),
            Err(Error::StateMismatch(_)),
        ));

        // Stray results are dropped
        message.crypt_done(Err(Error::UserCancelled));
        assert_eq!(CryptState::NoCryptMail, message.crypt_state());
        assert!(item.state().errors.is_empty());
    }

    #[test]
    fn read_only_item_aborts_inline_protection() {
        let mut config = SystemConfig::default();
        config.crypto.async_crypto = false;
        config.crypto.inline_pgp = true;
        let context = context(config);

        let item = FakeMailItem::new();
        {
            let mut state = item.state();
            state.body = "hi".to_owned();
            state.recipients = vec!["b@example.org".to_owned()];
            state.sender = Some("a@example.org".to_owned());
            state.flags = Some(ProtectionFlags::ENCRYPT);
        }
        let mut message = message(&item);

        assert_eq!(EventResponse::Cancel, message.on_send());
        item.state().read_only = true;
        assert!(matches!(message.on_after_write(&context), Followup::None));

        assert_eq!(CryptState::NoCryptMail, message.crypt_state());
        let state = item.state();
        assert_eq!("hi", state.body);
        assert_eq!(1, state.errors.len());
        assert_eq!(0, state.sends_requested);
    }

    #[test]
    fn wipe_only_when_needed() {
        let item = FakeMailItem::new();
        let mut message = message(&item);
        message.wipe().unwrap();
        message.on_close();
        assert_eq!(None, item.state().html_body);
        assert_eq!(EventResponse::Proceed, message.on_before_write());
    }

    #[test]
    fn smime_without_smime_support_is_saved_wiped() {
        let context = context(SystemConfig::default());
        let item = FakeMailItem::new();
        item.state().mime_source = SMIME_SOURCE.to_vec();
        let mut message = message(&item);

        read(&mut message, &context);
        assert_eq!(EventResponse::Cancel, message.on_before_write());

        message.parse_done(
            Ok(ParseResult {
                body: text("plain"),
                ..ParseResult::default()
            }),
            &context,
        );
        assert_eq!("plain", item.state().body);
        assert!(message.needs_wipe());

        assert_eq!(EventResponse::Proceed, message.on_before_write());
        assert_eq!(Some(WIPE_TEMPLATE), item.state().html_body.as_deref());
        assert!(!message.needs_wipe());
    }

    #[test]
    fn html_looking_text_is_shown_as_html() {
        let context = context(SystemConfig::default());
        let item = FakeMailItem::new();
        item.state().mime_source = SIGNED_SOURCE.to_vec();
        let mut message = message(&item);

        read(&mut message, &context);
        message.parse_done(
            Ok(ParseResult {
                body: text("<html><body>hi</body></html>"),
                ..ParseResult::default()
            }),
            &context,
        );
        assert_eq!(
            Some("<html><body>hi</body></html>"),
            item.state().html_body.as_deref()
        );

        // Results for a message no longer pending are dropped
        message.parse_done(
            Ok(ParseResult {
                body: text("again"),
                ..ParseResult::default()
            }),
            &context,
        );
        assert_ne!("again", item.state().body);
    }

    #[test]
    fn failed_verification_restores_original() {
        let context = context(SystemConfig::default());
        let item = FakeMailItem::new();
        {
            let mut state = item.state();
            state.mime_source = SIGNED_SOURCE.to_vec();
            state.body = "as received".to_owned();
        }
        let mut message = message(&item);

        read(&mut message, &context);
        message.parse_done(
            Err(ParseFailure {
                error: Error::EngineOperationFailed("broken".to_owned()),
                text: "Signature verification failed.".to_owned(),
            }),
            &context,
        );

        let state = item.state();
        assert_eq!("as received", state.body);
        assert_eq!(None, state.html_body);
        assert_eq!(1, state.errors.len());
        assert!(!message.needs_wipe());
        assert_eq!("Insecure", message.crypto_summary());
    }

    #[test]
    fn property_changes_are_harmless() {
        let item = FakeMailItem::new();
        let message = message(&item);
        message.on_property_change("Body");
        message.on_property_change("Subject");
        assert_eq!(InboundState::Unprocessed, message.inbound_state());
    }
}
