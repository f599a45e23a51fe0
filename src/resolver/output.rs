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

//! The line protocol spoken by the interactive resolver on its standard
//! output.
//!
//! Each line is one of
//!
//! - `cancel`: the user aborted.
//! - `unencrypted`: the user chose to send without protection.
//! - `sig:<protocol>:<fingerprint>`: the key to sign with.
//! - `enc:<protocol>:<fingerprint>`: one key to encrypt to.
//!
//! `<protocol>` is `smime` or anything else for OpenPGP.

use log::{error, warn};

use super::ResolveError;
use crate::engine::Protocol;

/// The fingerprints chosen in the interactive resolver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolverOutput {
    pub protocol: Protocol,
    pub signer: Option<String>,
    pub recipients: Vec<String>,
}

/// Parse the standard output of the resolver.
///
/// `protocol` is the protocol the caller already decided on, if any. If it
/// is `Unknown`, the protocol of the first selection line is used.
///
/// Only the first `sig` line counts; further ones are logged and ignored.
pub fn parse_resolver_output(
    stdout: &str,
    mut protocol: Protocol,
) -> Result<ResolverOutput, ResolveError> {
    let mut signer = None::<String>;
    let mut recipients = Vec::<String>::new();

    for line in stdout.lines() {
        let line = line.trim_end();
        match line {
            "" => continue,
            "cancel" => return Err(ResolveError::Cancelled),
            "unencrypted" => return Err(ResolveError::Unencrypted),
            _ => (),
        }

        let mut fields = line.splitn(3, ':');
        let what = fields.next().unwrap_or("");
        let how = fields.next().unwrap_or("");
        let fingerprint = fields.next().unwrap_or("").split(':').next();
        let fingerprint = fingerprint.unwrap_or("").trim();

        if Protocol::Unknown == protocol {
            protocol = if "smime" == how {
                Protocol::Smime
            } else {
                Protocol::OpenPgp
            };
        }

        if fingerprint.is_empty() {
            warn!("Resolver line without fingerprint: {:?}", line);
            continue;
        }

        match what {
            "sig" => {
                if let Some(ref first) = signer {
                    error!(
                        "Resolver selected multiple signing keys; \
                         keeping {} and ignoring {}",
                        first, fingerprint,
                    );
                } else {
                    signer = Some(fingerprint.to_owned());
                }
            },
            "enc" => recipients.push(fingerprint.to_owned()),
            _ => warn!("Unexpected resolver output: {:?}", line),
        }
    }

    Ok(ResolverOutput {
        protocol,
        signer,
        recipients,
    })
}
