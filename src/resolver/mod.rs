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

//! Turning addresses into keys.
//!
//! Resolution first tries the key cache, which needs no interaction. If the
//! cache cannot supply a complete key set (or auto-resolution is off), the
//! external resolver is run, which may show a dialogue and so can block for
//! as long as the user likes.

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::engine::keycache::KeyCache;
use crate::engine::{CryptoEngine, EngineError, Key, Protocol};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::{ResolverConfig, SystemConfig};

pub mod output;
pub mod process;

use self::output::ResolverOutput;
use self::process::ResolverRunner;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Key selection cancelled")]
    Cancelled,
    #[error("User chose to send unprotected")]
    Unencrypted,
    #[error("{0}")]
    Failed(String),
}

impl From<EngineError> for ResolveError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cancelled => ResolveError::Cancelled,
            EngineError::Failed(msg) => ResolveError::Failed(msg),
        }
    }
}

/// What needs keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveRequest {
    pub sender: String,
    /// Recipients, either bare addresses or `Name <addr>`.
    pub recipients: Vec<String>,
    pub sign: bool,
    pub encrypt: bool,
    /// The protocol to restrict to, or `Unknown` to let resolution decide.
    pub protocol: Protocol,
    /// Handle of the window the resolver dialogue should be modal to.
    pub window: Option<u64>,
}

/// The keys an outgoing message is protected with.
///
/// On success, `signer` is present if signing was requested and
/// `recipients` is non-empty if encryption was requested.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedKeySet {
    pub protocol: Protocol,
    pub signer: Option<Key>,
    pub recipients: Vec<Key>,
}

/// Extract the bare address from `Name <addr>`.
pub fn addr_spec(s: &str) -> &str {
    let s = s.trim();
    match (s.rfind('<'), s.rfind('>')) {
        (Some(start), Some(end)) if start < end => s[start + 1..end].trim(),
        _ => s,
    }
}

pub struct KeyResolver {
    engine: Arc<dyn CryptoEngine>,
    cache: Arc<dyn KeyCache>,
    runner: Arc<dyn ResolverRunner>,
    config: ResolverConfig,
    enable_smime: bool,
    prefer_smime: bool,
}

impl KeyResolver {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        cache: Arc<dyn KeyCache>,
        runner: Arc<dyn ResolverRunner>,
        config: &SystemConfig,
    ) -> Self {
        KeyResolver {
            engine,
            cache,
            runner,
            config: config.resolver.clone(),
            enable_smime: config.crypto.enable_smime,
            prefer_smime: config.crypto.prefer_smime,
        }
    }

    pub fn resolve(
        &self,
        request: &ResolveRequest,
        log_prefix: &LogPrefix,
    ) -> Result<ResolvedKeySet, ResolveError> {
        if self.config.autoresolve {
            if let Some(keys) = self.resolve_cached(request) {
                info!(
                    "{} Resolved {} keys through the cache",
                    log_prefix, keys.protocol,
                );
                return Ok(keys);
            }
            debug!("{} Cache could not resolve all keys", log_prefix);
        }

        self.resolve_interactive(request, log_prefix)
    }

    /// Try to find a complete key set in the cache.
    ///
    /// All keys of the result use the same protocol. OpenPGP is tried
    /// first, then S/MIME if enabled, unless `prefer_smime` reverses that.
    pub fn resolve_cached(
        &self,
        request: &ResolveRequest,
    ) -> Option<ResolvedKeySet> {
        let candidates: &[Protocol] = match request.protocol {
            Protocol::OpenPgp => &[Protocol::OpenPgp],
            Protocol::Smime if self.enable_smime => &[Protocol::Smime],
            Protocol::Smime => &[],
            Protocol::Unknown if !self.enable_smime => &[Protocol::OpenPgp],
            Protocol::Unknown if self.prefer_smime => {
                &[Protocol::Smime, Protocol::OpenPgp]
            },
            Protocol::Unknown => &[Protocol::OpenPgp, Protocol::Smime],
        };

        let addrs = request
            .recipients
            .iter()
            .map(|r| addr_spec(r).to_owned())
            .collect::<Vec<_>>();

        candidates.iter().find_map(|&protocol| {
            let recipients = if request.encrypt {
                let keys = self.cache.encryption_keys(&addrs, protocol);
                if keys.is_empty() {
                    return None;
                }
                keys
            } else {
                Vec::new()
            };

            let signer = if request.sign {
                if request.sender.is_empty() {
                    return None;
                }
                Some(self.cache.signing_key(&request.sender, protocol)?)
            } else {
                None
            };

            Some(ResolvedKeySet {
                protocol,
                signer,
                recipients,
            })
        })
    }

    fn resolve_interactive(
        &self,
        request: &ResolveRequest,
        log_prefix: &LogPrefix,
    ) -> Result<ResolvedKeySet, ResolveError> {
        let args = process::resolver_args(request, &self.config, self.enable_smime);
        info!(
            "{} Resolving keys with {}",
            log_prefix,
            self.config.program.display(),
        );

        let run = self.runner.run(&self.config.program, &args).map_err(|e| {
            ResolveError::Failed(format!(
                "Failed to run {}: {}",
                self.config.program.display(),
                e,
            ))
        })?;

        if Some(0) != run.status {
            warn!(
                "{} Resolver exited with status {:?}",
                log_prefix, run.status,
            );
        }

        let stdout = String::from_utf8_lossy(&run.stdout);
        let result = output::parse_resolver_output(&stdout, request.protocol)
            .and_then(|parsed| self.lookup_fingerprints(request, parsed));

        if let Err(ref e) = result {
            debug!("{} Key resolution failed: {}", log_prefix, e);
            debug!("{} Resolver stdout: {:?}", log_prefix, stdout);
            debug!(
                "{} Resolver stderr: {:?}",
                log_prefix,
                String::from_utf8_lossy(&run.stderr),
            );
        }

        result
    }

    /// Turn the fingerprints chosen in the resolver into full keys.
    pub fn lookup_fingerprints(
        &self,
        request: &ResolveRequest,
        parsed: ResolverOutput,
    ) -> Result<ResolvedKeySet, ResolveError> {
        if request.sign && parsed.signer.is_none() {
            return Err(ResolveError::Failed(
                "Signing requested but no signing key selected".to_owned(),
            ));
        }
        if request.encrypt && parsed.recipients.is_empty() {
            return Err(ResolveError::Failed(
                "Encryption requested but no recipient keys selected"
                    .to_owned(),
            ));
        }
        if Protocol::Unknown == parsed.protocol {
            return Err(ResolveError::Failed("No keys selected".to_owned()));
        }

        let protocol = parsed.protocol;
        let signer = match parsed.signer {
            Some(fpr) if request.sign => Some(
                self.engine
                    .list_keys(protocol, &[fpr.clone()])?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        ResolveError::Failed(format!(
                            "Signing key {} not found",
                            fpr
                        ))
                    })?,
            ),
            _ => None,
        };

        let recipients = if request.encrypt {
            let keys = self.engine.list_keys(protocol, &parsed.recipients)?;
            if let Some(missing) = parsed.recipients.iter().find(|fpr| {
                !keys.iter().any(|k| k.fingerprint.eq_ignore_ascii_case(fpr))
            }) {
                return Err(ResolveError::Failed(format!(
                    "Recipient key {} not found",
                    missing
                )));
            }
            keys
        } else {
            Vec::new()
        };

        Ok(ResolvedKeySet {
            protocol,
            signer,
            recipients,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::keycache::MemoryKeyCache;
    use crate::engine::Validity;
    use crate::test_support::{test_key, FakeEngine, ScriptedRunner};

    struct Fixture {
        cache: Arc<MemoryKeyCache>,
        runner: Arc<ScriptedRunner>,
        resolver: KeyResolver,
    }

    fn fixture(config: SystemConfig, keys: Vec<Key>) -> Fixture {
        let cache = Arc::new(MemoryKeyCache::new());
        for key in &keys {
            cache.insert(key.clone());
        }
        let runner = Arc::new(ScriptedRunner::new());
        let resolver = KeyResolver::new(
            Arc::new(FakeEngine::new(keys)),
            Arc::clone(&cache) as Arc<dyn KeyCache>,
            Arc::clone(&runner) as Arc<dyn ResolverRunner>,
            &config,
        );
        Fixture {
            cache,
            runner,
            resolver,
        }
    }

    fn request(sign: bool, encrypt: bool) -> ResolveRequest {
        ResolveRequest {
            sender: "a@example.org".to_owned(),
            recipients: vec!["Bob <b@example.org>".to_owned()],
            sign,
            encrypt,
            ..ResolveRequest::default()
        }
    }

    fn pgp_keys() -> Vec<Key> {
        vec![
            test_key("AAAA0001", "a@example.org", Validity::Ultimate, true),
            test_key("BBBB0002", "b@example.org", Validity::Full, false),
        ]
    }

    #[test]
    fn addr_specs() {
        assert_eq!("b@example.org", addr_spec("Bob <b@example.org>"));
        assert_eq!("b@example.org", addr_spec(" b@example.org "));
        assert_eq!("x>y<", addr_spec("x>y<"));
    }

    #[test]
    fn cache_path_needs_no_interaction() {
        let f = fixture(SystemConfig::default(), pgp_keys());
        let keys = f
            .resolver
            .resolve(&request(true, true), &LogPrefix::new("test"))
            .unwrap();

        assert_eq!(Protocol::OpenPgp, keys.protocol);
        assert_eq!("AAAA0001", keys.signer.unwrap().fingerprint);
        assert_eq!(1, keys.recipients.len());
        assert_eq!("BBBB0002", keys.recipients[0].fingerprint);
        assert!(f.runner.invocations().is_empty());
    }

    #[test]
    fn cache_falls_back_to_smime_only_if_enabled() {
        let mut smime_keys = pgp_keys();
        for key in &mut smime_keys {
            key.protocol = Protocol::Smime;
        }

        let f = fixture(SystemConfig::default(), smime_keys.clone());
        assert_eq!(None, f.resolver.resolve_cached(&request(true, true)));

        let mut config = SystemConfig::default();
        config.crypto.enable_smime = true;
        let f = fixture(config, smime_keys);
        let keys = f.resolver.resolve_cached(&request(true, true)).unwrap();
        assert_eq!(Protocol::Smime, keys.protocol);
    }

    #[test]
    fn cache_never_mixes_protocols() {
        let mut config = SystemConfig::default();
        config.crypto.enable_smime = true;
        let mut keys = pgp_keys();
        keys[0].protocol = Protocol::Smime;

        let f = fixture(config, keys);
        assert_eq!(None, f.resolver.resolve_cached(&request(true, true)));
        assert_eq!(
            Protocol::OpenPgp,
            f.resolver.resolve_cached(&request(false, true)).unwrap().protocol
        );
        assert_eq!(
            Protocol::Smime,
            f.resolver.resolve_cached(&request(true, false)).unwrap().protocol
        );
    }

    #[test]
    fn incomplete_cache_runs_resolver() {
        let f = fixture(SystemConfig::default(), pgp_keys());
        f.cache.clear();
        f.runner
            .push_stdout("sig:pgp:AAAA0001\nenc:pgp:BBBB0002\nenc:pgp:AAAA0001\n");

        let keys = f
            .resolver
            .resolve(&request(true, true), &LogPrefix::new("test"))
            .unwrap();
        assert_eq!("AAAA0001", keys.signer.unwrap().fingerprint);
        assert_eq!(2, keys.recipients.len());

        let invocations = f.runner.invocations();
        assert_eq!(1, invocations.len());
        assert!(invocations[0].contains(&"--encrypt".to_owned()));
        assert!(!invocations[0].contains(&"--alwaysShow".to_owned()));
    }

    #[test]
    fn resolver_cancel() {
        let f = fixture(SystemConfig::default(), Vec::new());
        f.runner.push_stdout("cancel\n");
        assert_eq!(
            Err(ResolveError::Cancelled),
            f.resolver.resolve(&request(true, true), &LogPrefix::new("test"))
        );
    }

    #[test]
    fn resolver_failures() {
        let f = fixture(SystemConfig::default(), pgp_keys());
        f.cache.clear();

        f.runner.push_stdout("enc:pgp:BBBB0002\n");
        assert_matches!(
            Err(ResolveError::Failed(_)),
            f.resolver.resolve(&request(true, true), &LogPrefix::new("test"))
        );

        f.runner.push_stdout("sig:pgp:AAAA0001\nenc:pgp:FFFF0009\n");
        assert_matches!(
            Err(ResolveError::Failed(_)),
            f.resolver.resolve(&request(true, true), &LogPrefix::new("test"))
        );

        f.runner.push_stdout("");
        assert_matches!(
            Err(ResolveError::Failed(_)),
            f.resolver.resolve(&request(false, true), &LogPrefix::new("test"))
        );

        f.runner.push_error("no such file");
        assert_matches!(
            Err(ResolveError::Failed(_)),
            f.resolver.resolve(&request(false, true), &LogPrefix::new("test"))
        );
    }

    #[test]
    fn no_autoresolve_always_asks() {
        let mut config = SystemConfig::default();
        config.resolver.autoresolve = false;
        let f = fixture(config, pgp_keys());
        f.runner.push_stdout("sig:pgp:AAAA0001\n");

        let keys = f
            .resolver
            .resolve(&request(true, false), &LogPrefix::new("test"))
            .unwrap();
        assert_eq!("AAAA0001", keys.signer.unwrap().fingerprint);
        assert!(keys.recipients.is_empty());
        assert!(f.runner.invocations()[0].contains(&"--alwaysShow".to_owned()));
    }
}
