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

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use crate::resolver::process::{ResolverRunner, RunOutput};

/// A `ResolverRunner` which replays queued results instead of running
/// anything, and records the command lines it was given.
///
/// With nothing queued, the "resolver" exits successfully without output.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<io::Result<RunOutput>>>,
    invocations: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.script.lock().unwrap().push_back(Ok(RunOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            status: Some(0),
        }));
    }

    /// Make the next run fail to start the process.
    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(io::Error::new(io::ErrorKind::NotFound, message)));
    }

    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.lock().unwrap().clone()
    }
}

impl ResolverRunner for ScriptedRunner {
    fn run(&self, _program: &Path, args: &[String]) -> io::Result<RunOutput> {
        self.invocations.lock().unwrap().push(args.to_vec());
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(RunOutput {
                status: Some(0),
                ..RunOutput::default()
            })
        })
    }
}
