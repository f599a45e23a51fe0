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

//! The boundary with the host mail client.

use super::state::ProtectionFlags;
use crate::mime::builder::OutgoingAttachment;
use crate::mime::extract::ExtractedAttachment;
use crate::support::error::Error;

/// One mail item of the host, as Sealpost sees it.
///
/// All methods are only ever called on the thread which delivers the host's
/// events. Errors are generally `Error::Host`; Sealpost treats them as
/// meaning the item is not (or no longer) in a state it can be modified in.
///
/// The host queues `request_save` and `request_send`: the events they cause
/// are delivered after the current event handler returns, never from within
/// the call.
pub trait MailItem: Send {
    /// The persistent unique id of the item, if it has been given one.
    fn uid(&self) -> Option<String>;
    /// Persist `uid` on the item, so it survives the host unloading it.
    fn set_uid(&mut self, uid: &str) -> Result<(), Error>;

    fn body(&self) -> Result<String, Error>;
    /// Replace the body with plain text, discarding any HTML body.
    fn set_body(&mut self, body: &str) -> Result<(), Error>;
    fn html_body(&self) -> Result<Option<String>, Error>;
    fn set_html_body(&mut self, html: &str) -> Result<(), Error>;

    /// The complete RFC 822 form of a received item.
    fn mime_source(&self) -> Result<Vec<u8>, Error>;
    fn attachments(&self) -> Result<Vec<OutgoingAttachment>, Error>;
    /// Show attachments found inside a protected item.
    fn add_attachments(
        &mut self,
        attachments: &[ExtractedAttachment],
    ) -> Result<(), Error>;

    /// The addresses of all To, CC and BCC recipients.
    fn recipients(&self) -> Result<Vec<String>, Error>;
    /// The address of the account the item will be sent through.
    fn sending_account_address(&self) -> Option<String>;
    /// The explicit sender address of the item.
    fn sender_address(&self) -> Option<String>;
    /// The address of the profile's current user.
    fn current_user_address(&self) -> Option<String>;

    /// The flags persisted on the item, or `None` if it never had any.
    fn protection_flags(&self) -> Option<ProtectionFlags>;
    fn set_protection_flags(
        &mut self,
        flags: ProtectionFlags,
    ) -> Result<(), Error>;

    /// Set (or with `None`, clear) the trust category shown for the item.
    fn set_trust_category(&mut self, category: Option<&str>)
        -> Result<(), Error>;

    /// Replace the stored content of the item with the complete MIME
    /// `envelope`. This either fully succeeds or leaves the item unchanged.
    fn set_envelope(&mut self, envelope: &[u8]) -> Result<(), Error>;

    /// The native window handle to parent dialogues to, if any.
    fn window(&self) -> Option<u64>;

    /// Queue a save of the item.
    fn request_save(&mut self) -> Result<(), Error>;
    /// Queue a send of the item.
    fn request_send(&mut self) -> Result<(), Error>;

    /// Tell the user that protecting or unprotecting the item failed.
    fn report_error(&mut self, error: &Error);
}
