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

//! The entry point for host integrations.
//!
//! A `Session` receives every event of every attached mail item on the
//! host's UI-affine thread, runs jobs on background threads, and applies
//! their results when the host calls `process_completions`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::host::MailItem;
use super::registry::{ItemHandle, JobKind, JobTicket, MessageRegistry};
use super::state::ProtectionFlags;
use super::{EventResponse, Followup, Message};
use crate::engine::keycache::KeyCache;
use crate::engine::CryptoEngine;
use crate::job::crypt::{CryptJob, CryptOutput};
use crate::job::parse::{ParseFailure, ParseJob, ParseResult};
use crate::job::JobContext;
use crate::resolver::process::ResolverRunner;
use crate::resolver::KeyResolver;
use crate::support::error::Error;
use crate::support::system_config::SystemConfig;
use crate::support::threading::Dispatcher;

/// The host events Sealpost reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailEvent {
    Open,
    BeforeRead,
    Read,
    BeforeWrite,
    AfterWrite,
    Send,
    Close,
    Unload,
    PropertyChange(String),
    /// The item was replied to, creating the item with the given handle.
    Reply(ItemHandle),
    /// The item was forwarded, creating the item with the given handle.
    Forward(ItemHandle),
}

enum Completion {
    Crypt {
        ticket: JobTicket,
        result: Result<CryptOutput, Error>,
    },
    Parse {
        ticket: JobTicket,
        outcome: Result<ParseResult, ParseFailure>,
    },
    /// The message was destroyed before the job got to run.
    Abandoned { ticket: JobTicket },
}

pub struct Session {
    context: JobContext,
    registry: Arc<MessageRegistry>,
    dispatcher: Dispatcher<Completion>,
}

impl Session {
    pub fn new(
        config: SystemConfig,
        engine: Arc<dyn CryptoEngine>,
        cache: Arc<dyn KeyCache>,
        runner: Arc<dyn ResolverRunner>,
    ) -> Self {
        let resolver = Arc::new(KeyResolver::new(
            Arc::clone(&engine),
            Arc::clone(&cache),
            runner,
            &config,
        ));
        Self::with_context(
            JobContext {
                engine,
                cache,
                resolver,
                config: Arc::new(config),
            },
            Arc::new(MessageRegistry::new()),
        )
    }

    pub fn with_context(
        context: JobContext,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        Session {
            context,
            registry,
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Start tracking the host item `item`, known by `handle`.
    pub fn attach(
        &self,
        handle: ItemHandle,
        item: Box<dyn MailItem>,
    ) -> Result<(), Error> {
        let mut message = Message::new(item)?;
        if self.registry.contains_uid(message.uid()) {
            warn!(
                "{} Uid already in use by another item; using a temporary one",
                message.log_prefix(),
            );
            message.reassign_uid();
        }

        debug!("{} Attached as item {}", message.log_prefix(), handle);
        self.registry.insert(handle, message)?;
        Ok(())
    }

    pub fn message(
        &self,
        handle: ItemHandle,
    ) -> Option<Arc<Mutex<Message>>> {
        self.registry.get(handle)
    }

    /// Change the protection the user wants for a draft.
    pub fn set_protection(
        &self,
        handle: ItemHandle,
        flags: ProtectionFlags,
    ) -> Result<(), Error> {
        let message = self.registry.get(handle).ok_or_else(|| {
            Error::StateMismatch(format!("unknown item {}", handle))
        })?;
        let mut message = message.lock().unwrap();
        message.set_protection_flags(flags)
    }

    pub fn handle_event(
        &self,
        handle: ItemHandle,
        event: MailEvent,
    ) -> EventResponse {
        if MailEvent::Unload == event {
            if self.registry.remove(handle).is_none() {
                debug!("Unload of unknown item {}", handle);
            }
            return EventResponse::Proceed;
        }

        let Some(message) = self.registry.get(handle) else {
            debug!("{:?} for unknown item {}", event, handle);
            return EventResponse::Proceed;
        };

        if let MailEvent::Reply(new) | MailEvent::Forward(new) = event {
            let flags = message.lock().unwrap().crypto_flags();
            self.copy_flags(new, flags);
            return EventResponse::Proceed;
        }

        let (response, followup) = {
            let mut message = message.lock().unwrap();
            self.dispatch(&mut message, event)
        };
        self.start(followup);
        response
    }

    fn dispatch(
        &self,
        message: &mut Message,
        event: MailEvent,
    ) -> (EventResponse, Followup) {
        let followup = match event {
            MailEvent::Open => {
                if let Err(e) = message.on_open(&self.context.config.crypto) {
                    warn!(
                        "{} Failed to seed protection flags: {}",
                        message.log_prefix(),
                        e,
                    );
                }
                Followup::None
            },

            MailEvent::BeforeRead => {
                if let Err(e) = message.on_before_read() {
                    warn!("{} Failed to classify: {}", message.log_prefix(), e);
                }
                Followup::None
            },

            MailEvent::Read => {
                if self.registry.job_live(message.uid(), JobKind::Parse) {
                    debug!("{} Already being parsed", message.log_prefix());
                    Followup::None
                } else {
                    message.on_read(&self.context)
                }
            },

            MailEvent::BeforeWrite => {
                return (message.on_before_write(), Followup::None);
            },

            MailEvent::AfterWrite => message.on_after_write(&self.context),

            MailEvent::Send => return (message.on_send(), Followup::None),

            MailEvent::Close => {
                message.on_close();
                Followup::None
            },

            MailEvent::PropertyChange(ref name) => {
                message.on_property_change(name);
                Followup::None
            },

            // Handled before the message is locked
            MailEvent::Unload | MailEvent::Reply(_) | MailEvent::Forward(_) => {
                Followup::None
            },
        };

        (EventResponse::Proceed, followup)
    }

    fn copy_flags(&self, handle: ItemHandle, flags: ProtectionFlags) {
        if flags.is_empty() {
            return;
        }

        match self.registry.get(handle) {
            Some(message) => {
                if let Err(e) =
                    message.lock().unwrap().set_protection_flags(flags)
                {
                    warn!("Failed to copy protection to item {}: {}", handle, e);
                }
            },
            None => debug!("Protection not copied: item {} unknown", handle),
        }
    }

    fn start(&self, followup: Followup) {
        match followup {
            Followup::None => (),
            Followup::StartParse(job) => self.start_parse(job),
            Followup::StartCrypt { uid, job } => self.start_crypt(uid, job),
        }
    }

    fn start_parse(&self, job: Arc<ParseJob>) {
        let uid = job.uid().to_owned();
        let kind = job.kind();
        let Some(ticket) = self.registry.begin_job(&uid, JobKind::Parse) else {
            error!("msg:{} Parse job refused by registry", uid);
            return;
        };

        let registry = Arc::clone(&self.registry);
        let spawned = self.dispatcher.spawn(
            thread_name("parse", &uid),
            {
                let ticket = ticket.clone();
                move || {
                    if !registry.is_current(&ticket) {
                        return Completion::Abandoned { ticket };
                    }

                    let outcome = job.run();
                    Completion::Parse { ticket, outcome }
                }
            },
            {
                let ticket = ticket.clone();
                move |what| Completion::Parse {
                    ticket,
                    outcome: Err(ParseFailure::aborted(
                        kind,
                        format!("internal error: {}", what),
                    )),
                }
            },
        );

        if let Err(e) = spawned {
            error!("msg:{} Failed to start parse job: {}", uid, e);
            self.apply(Completion::Parse {
                outcome: Err(ParseFailure {
                    text: format!("The message could not be processed: {}", e),
                    error: Error::Io(e),
                }),
                ticket,
            });
        }
    }

    fn start_crypt(&self, uid: String, job: CryptJob) {
        let Some(ticket) = self.registry.begin_job(&uid, JobKind::Crypt) else {
            error!("msg:{} Crypt job refused by registry", uid);
            if let Some(message) = self.registry.by_uid(&uid) {
                message.lock().unwrap().crypt_done(Err(Error::StateMismatch(
                    "another crypt job is running".to_owned(),
                )));
            }
            return;
        };

        let registry = Arc::clone(&self.registry);
        let spawned = self.dispatcher.spawn(
            thread_name("crypt", &uid),
            {
                let ticket = ticket.clone();
                move || {
                    if !registry.is_current(&ticket) {
                        return Completion::Abandoned { ticket };
                    }

                    let result = job.execute();
                    Completion::Crypt { ticket, result }
                }
            },
            {
                let ticket = ticket.clone();
                move |what| Completion::Crypt {
                    ticket,
                    result: Err(Error::EngineOperationFailed(format!(
                        "internal error: {}",
                        what,
                    ))),
                }
            },
        );

        if let Err(e) = spawned {
            error!("msg:{} Failed to start crypt job: {}", uid, e);
            self.apply(Completion::Crypt {
                ticket,
                result: Err(Error::Io(e)),
            });
        }
    }

    fn apply(&self, completion: Completion) {
        match completion {
            Completion::Crypt { ticket, result } => {
                match self.current_message(&ticket) {
                    Some(message) => message.lock().unwrap().crypt_done(result),
                    None => info!(
                        "msg:{} Gone; crypt result discarded",
                        ticket.uid(),
                    ),
                }
            },

            Completion::Parse { ticket, outcome } => {
                match self.current_message(&ticket) {
                    Some(message) => message
                        .lock()
                        .unwrap()
                        .parse_done(outcome, &self.context),
                    None => info!(
                        "msg:{} Gone; parse result discarded",
                        ticket.uid(),
                    ),
                }
            },

            Completion::Abandoned { ticket } => {
                self.registry.end_job(&ticket);
                debug!(
                    "msg:{} {:?} job abandoned",
                    ticket.uid(),
                    ticket.kind(),
                );
            },
        }
    }

    /// Release `ticket`, returning the message it was for if that message
    /// is still registered.
    fn current_message(
        &self,
        ticket: &JobTicket,
    ) -> Option<Arc<Mutex<Message>>> {
        if self.registry.end_job(ticket) {
            self.registry.by_uid(ticket.uid())
        } else {
            None
        }
    }

    /// Apply the results of all finished jobs. Returns how many there were.
    pub fn process_completions(&self) -> usize {
        let mut count = 0;
        while let Some(completion) = self.dispatcher.try_next() {
            self.apply(completion);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one job to finish and apply its result.
    ///
    /// Returns whether a result was applied.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        match self.dispatcher.next_timeout(timeout) {
            Some(completion) => {
                self.apply(completion);
                true
            },
            None => false,
        }
    }

    /// The number of jobs still running.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Wipe every message showing unprotected content, e.g. before the host
    /// shuts down. Returns the number of messages which could not be wiped.
    pub fn wipe_all(&self) -> usize {
        self.for_each_message(|message| message.wipe())
    }

    /// Revert every processed message to its original content, wiping those
    /// where that is impossible. Returns the number of failures.
    pub fn revert_all(&self) -> usize {
        self.for_each_message(|message| message.revert())
    }

    fn for_each_message(
        &self,
        mut f: impl FnMut(&mut Message) -> Result<(), Error>,
    ) -> usize {
        let mut failures = 0;
        for handle in self.registry.handles() {
            let Some(message) = self.registry.get(handle) else {
                continue;
            };

            let mut message = message.lock().unwrap();
            if let Err(e) = f(&mut message) {
                error!("{} {}", message.log_prefix(), e);
                failures += 1;
            }
        }
        failures
    }
}

fn thread_name(kind: &str, uid: &str) -> String {
    let mut name = format!("{}-", kind);
    name.extend(uid.chars().filter(|c| !c.is_control()).take(32));
    name
}
