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

//! Mapping of signature validity to the user-visible trust levels.
//!
//! | Level | Meaning                                                  |
//! |-------|----------------------------------------------------------|
//! | 0     | No signature, a broken one, or a trust conflict          |
//! | 1     | Signed by a key with no or little history                |
//! | 2     | Marginal validity, with history or a WKD-sourced key     |
//! | 3     | Full validity                                            |
//! | 4     | Ultimate validity, or full validity from a direct check  |

use crate::engine::{
    Key, KeyOrigin, Signature, Summary, TofuHistory, UserId, Validity,
};

/// The trust level of `sig` on a message sent by `sender`.
///
/// `ultimate_keys` are the user's own keys, used to recognise a
/// certification the user made directly.
pub fn signature_level(
    sig: &Signature,
    sender: Option<&str>,
    ultimate_keys: &[Key],
) -> u8 {
    if sig.is_bad() || sig.summary.contains(Summary::TOFU_CONFLICT) {
        return 0;
    }

    let key = sig.key.as_ref();
    let uid = key.and_then(|k| {
        sender
            .and_then(|addr| k.user_id_for(addr))
            .or_else(|| k.user_ids.first())
    });
    let tofu = uid.and_then(|u| u.tofu);
    if tofu.is_some_and(|t| t.is_conflict()) {
        return 0;
    }

    match sig.validity {
        Validity::Ultimate => 4,
        Validity::Full => {
            if uid.is_some_and(|u| is_directly_certified(u, ultimate_keys)) {
                4
            } else {
                3
            }
        },
        Validity::Marginal => {
            let from_wkd = key.is_some_and(|k| KeyOrigin::Wkd == k.origin);
            let history = tofu.map_or(TofuHistory::None, |t| t.history());
            if from_wkd || history >= TofuHistory::Basic {
                2
            } else {
                1
            }
        },
        Validity::Never => 0,
        Validity::Unknown | Validity::Undefined => u8::from(tofu.is_some()),
    }
}

/// Whether one of `ultimate_keys` certified `uid` under a user id of its own
/// with ultimate validity.
fn is_directly_certified(uid: &UserId, ultimate_keys: &[Key]) -> bool {
    uid.signatures.iter().any(|cert| {
        ultimate_keys.iter().any(|key| {
            key.matches_key_id(&cert.signer_key_id)
                && key.user_ids.iter().any(|own| {
                    Validity::Ultimate == own.validity
                        && own.uid == cert.signer_uid
                })
        })
    })
}

/// The one-line summary of the protection of a message.
pub fn crypto_summary(level: u8, signed: bool, encrypted: bool) -> String {
    match (signed && level >= 2, encrypted) {
        (true, true) => format!("Security Level {}", level),
        (true, false) => format!("Trust Level {}", level),
        (false, true) => "Encrypted".to_owned(),
        (false, false) => "Insecure".to_owned(),
    }
}

/// The name of the category a message signed at `level` is put in.
pub fn trust_category(level: u8) -> String {
    format!("Level {}", level)
}
