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

//! Fakes of the external services, for tests.
//!
//! The fake engine performs no real cryptography, but its output has the
//! same shape as the real thing (armored, line-oriented, with signatures that
//! break when the signed data changes), which is all the MIME layers care
//! about.

use std::sync::Arc;

use crate::engine::keycache::MemoryKeyCache;
use crate::engine::{Key, Protocol, UserId, Validity};
use crate::job::JobContext;
use crate::resolver::KeyResolver;
use crate::support::system_config::SystemConfig;

mod engine;
mod host;
mod runner;

pub use self::engine::FakeEngine;
pub use self::host::{FakeItemState, FakeMailItem};
pub use self::runner::ScriptedRunner;

/// An OpenPGP key for `addr` which can both sign and encrypt.
pub fn test_key(
    fingerprint: &str,
    addr: &str,
    validity: Validity,
    has_secret: bool,
) -> Key {
    Key {
        fingerprint: fingerprint.to_owned(),
        protocol: Protocol::OpenPgp,
        user_ids: vec![UserId {
            uid: format!("<{}>", addr),
            addr: addr.to_owned(),
            validity,
            ..UserId::default()
        }],
        has_secret,
        can_sign: true,
        can_encrypt: true,
        ..Key::default()
    }
}

/// A job context whose engine and key cache both know exactly `keys`.
pub fn test_context(
    keys: Vec<Key>,
) -> (JobContext, Arc<FakeEngine>, Arc<ScriptedRunner>) {
    test_context_with_config(keys, SystemConfig::default())
}

pub fn test_context_with_config(
    keys: Vec<Key>,
    config: SystemConfig,
) -> (JobContext, Arc<FakeEngine>, Arc<ScriptedRunner>) {
    let cache = Arc::new(MemoryKeyCache::new());
    for key in &keys {
        cache.insert(key.clone());
    }

    let engine = Arc::new(FakeEngine::new(keys));
    let runner = Arc::new(ScriptedRunner::new());
    let resolver = Arc::new(KeyResolver::new(
        Arc::clone(&engine) as _,
        Arc::clone(&cache) as _,
        Arc::clone(&runner) as _,
        &config,
    ));

    let context = JobContext {
        engine: Arc::clone(&engine) as _,
        cache,
        resolver,
        config: Arc::new(config),
    };
    (context, engine, runner)
}
