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

//! The process-wide index of live messages.
//!
//! Three locks are involved, always acquired in this order:
//!
//! 1. The *barrier*, which tracks the uid of every live message together
//!    with its generation and the jobs running for it. Destroying a message
//!    holds it for the whole removal, and background jobs take it briefly
//!    before and after their work, so a job can never observe a
//!    half-destroyed message.
//! 2. The handle index.
//! 3. The uid index.
//!
//! Messages themselves are behind their own mutexes, which are never
//! acquired while holding any of the above.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::Message;
use crate::support::error::Error;

/// The host's handle of a mail item.
pub type ItemHandle = u64;

/// The kinds of job a message can have running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Crypt,
    Parse,
}

/// Names one job of one incarnation of a message.
///
/// A uid is free for reuse as soon as its message is removed, so the uid
/// alone cannot tell the jobs of a message from those of its successor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobTicket {
    uid: String,
    generation: u64,
    kind: JobKind,
}

impl JobTicket {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct LiveJobs {
    generation: u64,
    crypt: bool,
    parse: bool,
}

impl LiveJobs {
    fn slot(&mut self, kind: JobKind) -> &mut bool {
        match kind {
            JobKind::Crypt => &mut self.crypt,
            JobKind::Parse => &mut self.parse,
        }
    }
}

#[derive(Default)]
pub struct MessageRegistry {
    generations: AtomicU64,
    barrier: Mutex<HashMap<String, LiveJobs>>,
    by_handle: Mutex<HashMap<ItemHandle, Arc<Mutex<Message>>>>,
    by_uid: Mutex<HashMap<String, ItemHandle>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `message` under `handle` and its uid.
    ///
    /// Fails if either is already in use.
    pub fn insert(
        &self,
        handle: ItemHandle,
        message: Message,
    ) -> Result<Arc<Mutex<Message>>, Error> {
        let uid = message.uid().to_owned();

        let mut barrier = self.barrier.lock().unwrap();
        let mut by_handle = self.by_handle.lock().unwrap();
        let mut by_uid = self.by_uid.lock().unwrap();

        if by_handle.contains_key(&handle) {
            return Err(Error::StateMismatch(format!(
                "item {} registered twice",
                handle,
            )));
        }
        if barrier.contains_key(&uid) || by_uid.contains_key(&uid) {
            return Err(Error::StateMismatch(format!(
                "uid {} registered twice",
                uid,
            )));
        }

        let message = Arc::new(Mutex::new(message));
        barrier.insert(
            uid.clone(),
            LiveJobs {
                generation: self.generations.fetch_add(1, Ordering::Relaxed),
                ..LiveJobs::default()
            },
        );
        by_handle.insert(handle, Arc::clone(&message));
        by_uid.insert(uid, handle);
        Ok(message)
    }

    pub fn get(&self, handle: ItemHandle) -> Option<Arc<Mutex<Message>>> {
        self.by_handle.lock().unwrap().get(&handle).cloned()
    }

    pub fn by_uid(&self, uid: &str) -> Option<Arc<Mutex<Message>>> {
        let handle = *self.by_uid.lock().unwrap().get(uid)?;
        self.get(handle)
    }

    pub fn contains_uid(&self, uid: &str) -> bool {
        self.barrier.lock().unwrap().contains_key(uid)
    }

    /// All registered handles, in no particular order.
    pub fn handles(&self) -> Vec<ItemHandle> {
        self.by_handle.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_handle.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    /// Destroy the message registered under `handle`.
    ///
    /// Once this returns, no job will find the message through the registry,
    /// and any job still running for it will discard its result.
    pub fn remove(&self, handle: ItemHandle) -> Option<Arc<Mutex<Message>>> {
        let mut barrier = self.barrier.lock().unwrap();
        let message = self.by_handle.lock().unwrap().remove(&handle)?;

        let mut by_uid = self.by_uid.lock().unwrap();
        let uid = by_uid
            .iter()
            .find(|&(_, &h)| h == handle)
            .map(|(uid, _)| uid.clone());
        if let Some(uid) = uid {
            by_uid.remove(&uid);
            barrier.remove(&uid);
        }

        Some(message)
    }

    /// Record that a job of `kind` is starting for `uid`.
    ///
    /// Returns `None`, and records nothing, if the message is gone or
    /// already has such a job.
    pub fn begin_job(&self, uid: &str, kind: JobKind) -> Option<JobTicket> {
        let mut barrier = self.barrier.lock().unwrap();
        let jobs = barrier.get_mut(uid)?;

        let slot = jobs.slot(kind);
        if *slot {
            return None;
        }

        *slot = true;
        Some(JobTicket {
            uid: uid.to_owned(),
            generation: jobs.generation,
            kind,
        })
    }

    pub fn job_live(&self, uid: &str, kind: JobKind) -> bool {
        self.barrier
            .lock()
            .unwrap()
            .get_mut(uid)
            .is_some_and(|jobs| *jobs.slot(kind))
    }

    /// Record that the job of `ticket` is over.
    ///
    /// Returns whether the message it ran for is still registered. If it is
    /// not, any message now holding the same uid is left untouched.
    pub fn end_job(&self, ticket: &JobTicket) -> bool {
        let mut barrier = self.barrier.lock().unwrap();
        match barrier.get_mut(&ticket.uid) {
            Some(jobs) if jobs.generation == ticket.generation => {
                *jobs.slot(ticket.kind) = false;
                true
            },
            _ => false,
        }
    }

    /// Whether the message the job of `ticket` runs for still exists.
    ///
    /// Background jobs call this before starting their work.
    pub fn is_current(&self, ticket: &JobTicket) -> bool {
        self.barrier
            .lock()
            .unwrap()
            .get(&ticket.uid)
            .is_some_and(|jobs| jobs.generation == ticket.generation)
    }
}
