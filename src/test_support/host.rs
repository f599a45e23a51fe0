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

use std::sync::{Arc, Mutex, MutexGuard};

use crate::message::host::MailItem;
use crate::message::state::ProtectionFlags;
use crate::mime::builder::OutgoingAttachment;
use crate::mime::extract::ExtractedAttachment;
use crate::support::error::Error;

/// The observable state of a `FakeMailItem`.
#[derive(Debug, Default)]
pub struct FakeItemState {
    pub uid: Option<String>,
    pub body: String,
    pub html_body: Option<String>,
    pub mime_source: Vec<u8>,
    pub attachments: Vec<OutgoingAttachment>,
    pub shown_attachments: Vec<ExtractedAttachment>,
    pub recipients: Vec<String>,
    pub sending_account: Option<String>,
    pub sender: Option<String>,
    pub current_user: Option<String>,
    pub flags: Option<ProtectionFlags>,
    pub category: Option<String>,
    pub envelope: Option<Vec<u8>>,
    pub saves_requested: u32,
    pub sends_requested: u32,
    pub errors: Vec<String>,
    /// Makes every modification of the body fail.
    pub read_only: bool,
}

/// A `MailItem` whose state stays inspectable after it has been handed over.
#[derive(Clone, Default)]
pub struct FakeMailItem {
    state: Arc<Mutex<FakeItemState>>,
}

impl FakeMailItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeItemState> {
        self.state.lock().unwrap()
    }

    fn writable(&self) -> Result<MutexGuard<'_, FakeItemState>, Error> {
        let state = self.state();
        if state.read_only {
            Err(Error::Host("item is read-only".to_owned()))
        } else {
            Ok(state)
        }
    }
}

impl MailItem for FakeMailItem {
    fn uid(&self) -> Option<String> {
        self.state().uid.clone()
    }

    fn set_uid(&mut self, uid: &str) -> Result<(), Error> {
        self.state().uid = Some(uid.to_owned());
        Ok(())
    }

    fn body(&self) -> Result<String, Error> {
        Ok(self.state().body.clone())
    }

    fn set_body(&mut self, body: &str) -> Result<(), Error> {
        let mut state = self.writable()?;
        state.body = body.to_owned();
        state.html_body = None;
        Ok(())
    }

    fn html_body(&self) -> Result<Option<String>, Error> {
        Ok(self.state().html_body.clone())
    }

    fn set_html_body(&mut self, html: &str) -> Result<(), Error> {
        self.writable()?.html_body = Some(html.to_owned());
        Ok(())
    }

    fn mime_source(&self) -> Result<Vec<u8>, Error> {
        Ok(self.state().mime_source.clone())
    }

    fn attachments(&self) -> Result<Vec<OutgoingAttachment>, Error> {
        Ok(self.state().attachments.clone())
    }

    fn add_attachments(
        &mut self,
        attachments: &[ExtractedAttachment],
    ) -> Result<(), Error> {
        self.state()
            .shown_attachments
            .extend(attachments.iter().cloned());
        Ok(())
    }

    fn recipients(&self) -> Result<Vec<String>, Error> {
        Ok(self.state().recipients.clone())
    }

    fn sending_account_address(&self) -> Option<String> {
        self.state().sending_account.clone()
    }

    fn sender_address(&self) -> Option<String> {
        self.state().sender.clone()
    }

    fn current_user_address(&self) -> Option<String> {
        self.state().current_user.clone()
    }

    fn protection_flags(&self) -> Option<ProtectionFlags> {
        self.state().flags
    }

    fn set_protection_flags(
        &mut self,
        flags: ProtectionFlags,
    ) -> Result<(), Error> {
        self.state().flags = Some(flags);
        Ok(())
    }

    fn set_trust_category(
        &mut self,
        category: Option<&str>,
    ) -> Result<(), Error> {
        self.state().category = category.map(str::to_owned);
        Ok(())
    }

    fn set_envelope(&mut self, envelope: &[u8]) -> Result<(), Error> {
        self.writable()?.envelope = Some(envelope.to_vec());
        Ok(())
    }

    fn window(&self) -> Option<u64> {
        None
    }

    fn request_save(&mut self) -> Result<(), Error> {
        self.state().saves_requested += 1;
        Ok(())
    }

    fn request_send(&mut self) -> Result<(), Error> {
        self.state().sends_requested += 1;
        Ok(())
    }

    fn report_error(&mut self, error: &Error) {
        self.state().errors.push(error.to_string());
    }
}
