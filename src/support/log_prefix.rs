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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// concerning one message.
///
/// Clones of a `LogPrefix` share the same underlying data, so a job running
/// on a background thread picks up the uid once the message learns it.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    kind: &'static str,
    uid: Option<String>,
    protocol: Option<&'static str>,
}

impl LogPrefix {
    pub fn new(kind: &'static str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                kind,
                uid: None,
                protocol: None,
            })),
        }
    }

    pub fn set_uid(&self, uid: &str) {
        self.inner.lock().unwrap().uid = Some(sanitise(uid));
    }

    pub fn set_protocol(&self, protocol: &'static str) {
        self.inner.lock().unwrap().protocol = Some(protocol);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.kind)?;
        if let Some(ref uid) = inner.uid {
            write!(f, ":{uid}")?;
        }
        if let Some(protocol) = inner.protocol {
            write!(f, "[{protocol}]")?;
        }

        Ok(())
    }
}

impl fmt::Debug for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LogPrefix({self})")
    }
}

fn sanitise(s: &str) -> String {
    let mut s = s.to_owned();
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
