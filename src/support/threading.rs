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

//! Utilities for running jobs off the UI-affine thread.
//!
//! Host callbacks arrive on a single thread which must never block, but
//! crypto operations can take arbitrarily long (the engine may be waiting on a
//! passphrase prompt, the resolver on the user). Each job therefore gets its
//! own thread, and reports back by posting its result to a channel. The
//! thread owning the orchestration state drains that channel whenever it gets
//! control; background threads never mutate that state themselves.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use lazy_static::lazy_static;
use log::error;

lazy_static! {
    /// Held for the duration of every inbound parse.
    ///
    /// Rapid read events for the same or different messages otherwise cause
    /// concurrent decryption attempts, each of which may prompt for a
    /// passphrase.
    static ref PARSE_LOCK: Mutex<()> = Mutex::new(());
}

/// Run `f` while holding the process-wide parse serialisation lock.
pub fn serialize_parsing<R>(f: impl FnOnce() -> R) -> R {
    // A panic in some earlier parse says nothing about the state of the unit
    // value inside, so poisoning is ignored.
    let _guard = PARSE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    f()
}

/// Spawns background jobs and collects their completions.
pub struct Dispatcher<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    in_flight: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Dispatcher {
            sender,
            receiver,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `task` on a new thread named `name`, posting its return value as a
    /// completion.
    ///
    /// Should `task` panic, the value `on_panic` makes of the panic message is
    /// posted instead, so every job that starts also completes.
    ///
    /// If the thread cannot be created, returns the error without having run
    /// the task.
    pub fn spawn(
        &self,
        name: String,
        task: impl FnOnce() -> T + Send + 'static,
        on_panic: impl FnOnce(String) -> T + Send + 'static,
    ) -> std::io::Result<()> {
        let sender = self.sender.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&in_flight));

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            // The task owns everything it touches; nothing it leaves behind
            // is observed after a panic.
            let result = panic::catch_unwind(AssertUnwindSafe(task))
                .unwrap_or_else(|payload| {
                    let what = panic_message(&*payload);
                    error!("Job {} panicked: {}", name, what);
                    on_panic(what)
                });
            if sender.send(result).is_err() {
                error!("Completion of {} dropped: dispatcher is gone", name);
            }
        });

        spawned.map(|_| ())
    }

    /// Return the next completion if one is ready.
    pub fn try_next(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next completion.
    pub fn next_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// The number of spawned jobs whose threads have not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(&s) = payload.downcast_ref::<&str>() {
        s.to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Decrements the in-flight count even if the task panics, or if the thread
/// never starts and the closure owning this is dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn completions_are_delivered() {
        let dispatcher = Dispatcher::<u32>::new();
        for i in 0..4 {
            dispatcher
                .spawn(format!("job-{}", i), move || i * 2, |_| u32::MAX)
                .unwrap();
        }

        let mut results = (0..4)
            .map(|_| dispatcher.next_timeout(Duration::from_secs(10)).unwrap())
            .collect::<Vec<_>>();
        results.sort_unstable();
        assert_eq!(vec![0, 2, 4, 6], results);
        assert_eq!(None, dispatcher.try_next());
    }

    #[test]
    fn panicking_job_still_completes() {
        let dispatcher = Dispatcher::<Result<u32, String>>::new();
        dispatcher
            .spawn(
                "doomed".to_owned(),
                || panic!("job exploded: {}", 42),
                Err,
            )
            .unwrap();
        dispatcher
            .spawn("static".to_owned(), || panic!("boom"), Err)
            .unwrap();

        let mut results = (0..2)
            .map(|_| dispatcher.next_timeout(Duration::from_secs(10)).unwrap())
            .collect::<Vec<_>>();
        results.sort_unstable();
        assert_eq!(
            vec![Err("boom".to_owned()), Err("job exploded: 42".to_owned())],
            results
        );

        for _ in 0..1000 {
            if 0 == dispatcher.in_flight() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(0, dispatcher.in_flight());
        assert_eq!(None, dispatcher.try_next());
    }

    #[test]
    fn parsing_is_serialised() {
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let threads = (0..4)
            .map(|_| {
                let busy = Arc::clone(&busy);
                let overlapped = Arc::clone(&overlapped);
                thread::spawn(move || {
                    serialize_parsing(|| {
                        if busy.swap(true, Ordering::SeqCst) {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(10));
                        busy.store(false, Ordering::SeqCst);
                    })
                })
            })
            .collect::<Vec<_>>();

        for t in threads {
            t.join().unwrap();
        }

        assert!(!overlapped.load(Ordering::SeqCst));
    }
}
