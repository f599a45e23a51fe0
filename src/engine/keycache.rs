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

use std::collections::HashMap;
use std::sync::RwLock;

use super::{Key, Protocol, Validity};

/// A read-mostly index of keys by mail address.
///
/// Population happens elsewhere (typically a background key listing when
/// the host starts); lookups must be safe from any number of threads.
pub trait KeyCache: Send + Sync {
    /// The best key to encrypt to `addr` with, if any.
    fn encryption_key(&self, addr: &str, protocol: Protocol) -> Option<Key>;

    /// The best key with an available secret to sign as `addr`, if any.
    fn signing_key(&self, addr: &str, protocol: Protocol) -> Option<Key>;

    /// All keys with ultimate validity whose secret is available.
    fn ultimate_keys(&self) -> Vec<Key>;

    /// Encryption keys for every address in `addrs`.
    ///
    /// Returns an empty list unless *every* address has a key.
    fn encryption_keys(&self, addrs: &[String], protocol: Protocol) -> Vec<Key> {
        addrs
            .iter()
            .map(|addr| self.encryption_key(addr, protocol))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default()
    }
}

/// The standard in-memory `KeyCache`.
#[derive(Debug, Default)]
pub struct MemoryKeyCache {
    by_addr: RwLock<HashMap<(Protocol, String), Vec<Key>>>,
}

impl MemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key` under every address among its user ids, replacing any
    /// earlier version of the same key.
    pub fn insert(&self, key: Key) {
        let mut by_addr = self.by_addr.write().unwrap();
        for uid in &key.user_ids {
            if uid.addr.is_empty() {
                continue;
            }

            let keys = by_addr
                .entry((key.protocol, uid.addr.to_lowercase()))
                .or_default();
            keys.retain(|k| k.fingerprint != key.fingerprint);
            keys.push(key.clone());
        }
    }

    pub fn clear(&self) {
        self.by_addr.write().unwrap().clear();
    }

    fn best(
        &self,
        addr: &str,
        protocol: Protocol,
        usable: impl Fn(&Key) -> bool,
    ) -> Option<Key> {
        let by_addr = self.by_addr.read().unwrap();
        by_addr
            .get(&(protocol, addr.to_lowercase()))?
            .iter()
            .filter(|k| usable(k))
            .filter(|k| {
                k.user_id_for(addr)
                    .is_some_and(|u| u.validity > Validity::Never)
            })
            .max_by_key(|k| {
                (
                    k.user_id_for(addr).map(|u| u.validity),
                    k.has_secret,
                )
            })
            .cloned()
    }
}

impl KeyCache for MemoryKeyCache {
    fn encryption_key(&self, addr: &str, protocol: Protocol) -> Option<Key> {
        self.best(addr, protocol, |k| k.can_encrypt)
    }

    fn signing_key(&self, addr: &str, protocol: Protocol) -> Option<Key> {
        self.best(addr, protocol, |k| k.can_sign && k.has_secret)
    }

    fn ultimate_keys(&self) -> Vec<Key> {
        let by_addr = self.by_addr.read().unwrap();
        let mut keys = Vec::<Key>::new();
        for key in by_addr.values().flatten() {
            if key.has_secret
                && Validity::Ultimate == key.best_validity()
                && !keys.iter().any(|k| k.fingerprint == key.fingerprint)
            {
                keys.push(key.clone());
            }
        }
        keys
    }
}
