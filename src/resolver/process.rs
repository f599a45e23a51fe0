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
use std::path::Path;
use std::process::{Command, Stdio};

use super::{addr_spec, ResolveRequest};
use crate::support::system_config::ResolverConfig;

/// What a finished resolver process left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    /// Diagnostic only.
    pub stderr: Vec<u8>,
    /// The exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
}

/// Runs the interactive resolver to completion.
///
/// This blocks until the user is done with the resolver dialogue, so it is
/// only called from background threads. There is no timeout.
pub trait ResolverRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String]) -> io::Result<RunOutput>;
}

/// Runs the resolver as a child process.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandRunner;

impl ResolverRunner for CommandRunner {
    fn run(&self, program: &Path, args: &[String]) -> io::Result<RunOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(RunOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status.code(),
        })
    }
}

/// Build the command line for the resolver.
pub fn resolver_args(
    request: &ResolveRequest,
    config: &ResolverConfig,
    enable_smime: bool,
) -> Vec<String> {
    let mut args = Vec::<String>::new();
    if config.debug {
        args.push("--debug".to_owned());
    }

    if let Some(window) = request.window {
        args.push("--hwnd".to_owned());
        args.push(window.to_string());
    }

    args.push("--overlayText".to_owned());
    args.push(
        if request.encrypt {
            "Resolving recipients..."
        } else {
            "Resolving signers..."
        }
        .to_owned(),
    );

    if !enable_smime {
        args.push("--protocol".to_owned());
        args.push("pgp".to_owned());
    }

    if request.sign {
        args.push("--sign".to_owned());
    }

    if !request.sender.is_empty() {
        args.push("--sender".to_owned());
        args.push(request.sender.clone());
    }

    if !config.autoresolve {
        args.push("--alwaysShow".to_owned());
    }

    if request.encrypt {
        args.push("--encrypt".to_owned());
        args.extend(request.recipients.iter().map(|r| addr_spec(r).to_owned()));
    }

    args.push("--lang".to_owned());
    args.push(config.lang.clone());
    args
}
