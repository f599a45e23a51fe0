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

use bitflags::bitflags;

/// Where an outgoing message is in the protect-then-send sequence.
///
/// ```text
/// NoCryptMail -> NeedsFirstAfterWrite -> NeedsActualCrypt
///   sync:  -> NeedsUpdateInMapi -> NeedsUpdateInOom -> WantsSend*
///   async: -> (job) -> NeedsUpdateInOom -> NeedsSecondAfterWrite
///          -> NeedsUpdateInMapi -> WantsSend*
/// ```
///
/// Any state may fall back to `NoCryptMail` when protection fails or is
/// cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CryptState {
    #[default]
    NoCryptMail,
    /// Send was intercepted; waiting for the save it triggered to complete.
    NeedsFirstAfterWrite,
    /// The crypt job may run.
    NeedsActualCrypt,
    /// The envelope must be written into the stored item.
    NeedsUpdateInMapi,
    /// The visible item (body of inline messages) must be updated.
    NeedsUpdateInOom,
    /// Waiting for the save that stores the envelope.
    NeedsSecondAfterWrite,
    WantsSendMime,
    WantsSendInline,
}

impl CryptState {
    /// Whether the message is protected and the next send may pass.
    pub fn wants_send(self) -> bool {
        matches!(self, CryptState::WantsSendMime | CryptState::WantsSendInline)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_become(self, next: CryptState) -> bool {
        use self::CryptState::*;

        matches!(
            (self, next),
            (_, NoCryptMail)
                | (NoCryptMail, NeedsFirstAfterWrite)
                | (NeedsFirstAfterWrite, NeedsActualCrypt)
                | (NeedsActualCrypt, NeedsUpdateInMapi)
                | (NeedsActualCrypt, NeedsUpdateInOom)
                | (NeedsUpdateInMapi, NeedsUpdateInOom)
                | (NeedsUpdateInMapi, WantsSendMime)
                | (NeedsUpdateInMapi, WantsSendInline)
                | (NeedsUpdateInOom, NeedsSecondAfterWrite)
                | (NeedsUpdateInOom, WantsSendMime)
                | (NeedsUpdateInOom, WantsSendInline)
                | (NeedsSecondAfterWrite, NeedsUpdateInMapi)
        )
    }
}

/// Progress of an incoming protected message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InboundState {
    #[default]
    Unprocessed,
    /// A parse job is running and the placeholder is shown.
    Pending,
    /// The parse job's results have been applied.
    Processed,
}

bitflags! {
    /// The protection the user wants for a draft, persisted on the item.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ProtectionFlags: u32 {
        const ENCRYPT = 1 << 0;
        const SIGN = 1 << 1;
    }
}
