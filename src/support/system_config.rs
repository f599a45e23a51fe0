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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The process-wide configuration for Sealpost.
///
/// This is normally stored in a file named `sealpost.toml` alongside the
/// host integration. Every section may be omitted.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Options controlling which protections are applied and how.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Configuration for key resolution.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Limits and behaviour of the inbound MIME parser.
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// If true, S/MIME may be used when no OpenPGP key is available.
    ///
    /// When false, the interactive resolver is restricted to OpenPGP and the
    /// cache never considers S/MIME keys.
    pub enable_smime: bool,

    /// If true and S/MIME is enabled, cached S/MIME keys are tried before
    /// OpenPGP ones.
    pub prefer_smime: bool,

    /// If true, outgoing OpenPGP messages are protected inline (the body text
    /// is replaced by the armored output) instead of using PGP/MIME.
    ///
    /// Inline protection cannot carry attachments; messages with attachments
    /// are always protected as MIME.
    pub inline_pgp: bool,

    /// If true, the crypto operations of outgoing messages run on a
    /// background thread and the message is re-saved and re-sent when they
    /// complete. Otherwise the host's send event blocks until done.
    pub async_crypto: bool,

    /// Newly composed messages are signed by default.
    pub sign_default: bool,

    /// Newly composed messages are encrypted by default.
    pub encrypt_default: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// If true, keys are first looked up in the key cache and the interactive
    /// resolver is only consulted if that fails. The resolver is then also
    /// not forced to show its dialogue.
    pub autoresolve: bool,

    /// The path to the interactive resolver executable.
    pub program: PathBuf,

    /// The locale passed to the resolver with `--lang`.
    pub lang: String,

    /// Whether to pass `--debug` to the resolver.
    pub debug: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            autoresolve: true,
            program: PathBuf::from("resolver"),
            lang: "en".to_owned(),
            debug: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserConfig {
    /// If true, text parts in a charset other than UTF-8 are converted with
    /// a full charset decoder. Otherwise they are assumed to be Latin-1.
    pub convert_charsets: bool,

    /// The longest line, in bytes, accepted in decrypted or signed content.
    pub max_line_length: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            convert_charsets: true,
            max_line_length: 1024 * 1024,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        CryptoConfig {
            enable_smime: false,
            prefer_smime: false,
            inline_pgp: false,
            async_crypto: true,
            sign_default: false,
            encrypt_default: false,
        }
    }
}

impl SystemConfig {
    /// Read and parse the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
