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

//! The two kinds of background work: protecting an outgoing message and
//! unprotecting an incoming one.
//!
//! Jobs never touch the host's mail item. Everything they need is copied
//! out of it on the UI-affine thread before they start, and everything they
//! produce is applied to it there after they complete.

use std::sync::Arc;

use crate::engine::keycache::KeyCache;
use crate::engine::CryptoEngine;
use crate::resolver::KeyResolver;
use crate::support::system_config::SystemConfig;

pub mod crypt;
pub mod parse;

/// The shared services jobs run against.
#[derive(Clone)]
pub struct JobContext {
    pub engine: Arc<dyn CryptoEngine>,
    pub cache: Arc<dyn KeyCache>,
    pub resolver: Arc<KeyResolver>,
    pub config: Arc<SystemConfig>,
}
