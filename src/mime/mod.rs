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

//! The MIME codec: the streaming parser, content decoding, and construction
//! of the trees and envelopes handed to and received from the crypto engine.

pub mod builder;
pub mod content_encoding;
pub mod envelope;
pub mod extract;
pub mod grovel;
pub mod header;
pub mod kind;
pub mod quoted_printable;
