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

use std::io;

use thiserror::Error;

use crate::engine::EngineError;
use crate::resolver::ResolveError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation cancelled by user")]
    UserCancelled,
    #[error("No usable keys: {0}")]
    KeyResolutionFailed(String),
    #[error("Crypto operation failed: {0}")]
    EngineOperationFailed(String),
    #[error("Failed to build envelope: {0}")]
    EnvelopeBuildFailed(String),
    #[error("Malformed message: {0}")]
    ParserAnomaly(String),
    #[error("Operation not permitted in current state: {0}")]
    StateMismatch(String),
    #[error("Mail item unavailable: {0}")]
    Host(String),
    #[error("Bad configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error reflects a deliberate user decision rather than a
    /// failure that should be reported.
    pub fn is_cancellation(&self) -> bool {
        matches!(*self, Error::UserCancelled)
    }
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cancelled => Error::UserCancelled,
            EngineError::Failed(msg) => Error::EngineOperationFailed(msg),
        }
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Cancelled => Error::UserCancelled,
            ResolveError::Unencrypted => Error::KeyResolutionFailed(
                "protection declined in key selection".to_owned(),
            ),
            ResolveError::Failed(msg) => Error::KeyResolutionFailed(msg),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
