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

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use structopt::clap;
use structopt::StructOpt;

use crate::engine::Protocol;
use crate::mime::extract::{self, ExtractOptions, Extracted};
use crate::mime::kind;
use crate::resolver::output::{parse_resolver_output, ResolverOutput};
use crate::resolver::ResolveError;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The Sealpost configuration file.
    ///
    /// If a `logging.toml` exists in the same directory, it configures
    /// logging.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Log debug messages to standard error.
    #[structopt(short, long)]
    verbose: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Print how the RFC 822 message in a file is protected.
    Classify {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
    /// Print the body and attachments of an unprotected MIME message.
    ///
    /// This runs the same extraction used on decrypted or verified content.
    Extract {
        /// Print the HTML body instead of the plain text one, if there is
        /// one.
        #[structopt(long)]
        html: bool,

        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
    /// Interpret the captured standard output of the key resolver.
    ResolverOutput {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options =
        Options::from_clap(&match Options::clap().get_matches_safe() {
            Ok(matches) => matches,
            Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::HelpDisplayed,
                    ..
                },
            )
            | Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::VersionDisplayed,
                    ..
                },
            ) => {
                println!("{}", e.message);
                return;
            },
            Err(e) => {
                eprintln!("{}", e.message);
                EX_USAGE.exit()
            },
        });

    init_logging(options.config.as_deref(), options.verbose);

    let config = match options.config {
        None => SystemConfig::default(),
        Some(ref path) => match SystemConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error in config file '{}': {}", path.display(), e);
                EX_CONFIG.exit()
            },
        },
    };

    match options.command {
        Command::Classify { file } => classify(&file),
        Command::Extract { html, file } => extract(&config, html, &file),
        Command::ResolverOutput { file } => resolver_output(&config, &file),
    }
}

fn init_logging(config_path: Option<&Path>, verbose: bool) {
    let log_config_file = config_path
        .and_then(Path::parent)
        .map(|dir| dir.join("logging.toml"));
    if let Some(log_config_file) = log_config_file.filter(|f| f.is_file()) {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::config::Deserializers::new(),
        ) {
            eprintln!(
                "Error in logging config '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
        return;
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    let initialised = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| e.to_string())
        .and_then(|config| {
            log4rs::init_config(config).map_err(|e| e.to_string())
        });
    if let Err(e) = initialised {
        eprintln!("Failed to initialise logging: {}", e);
        EX_SOFTWARE.exit();
    }
}

fn read_input(path: &Path) -> Vec<u8> {
    match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error reading '{}': {}", path.display(), e);
            EX_NOINPUT.exit()
        },
    }
}

fn classify(path: &Path) {
    let data = read_input(path);
    match kind::classify(&data[..]) {
        Ok(kind) => println!("{:?}", kind),
        Err(e) => {
            eprintln!("Error classifying '{}': {}", path.display(), e);
            EX_DATAERR.exit()
        },
    }
}

fn extract(config: &SystemConfig, html: bool, path: &Path) {
    let data = read_input(path);
    let extracted =
        match extract::extract(&data[..], ExtractOptions::from(&config.parser))
        {
            Ok(extracted) => extracted,
            Err(e) => {
                eprintln!("Error parsing '{}': {}", path.display(), e);
                EX_DATAERR.exit()
            },
        };

    print!("{}", describe_extracted(&extracted, html));
    if let Some(ref anomaly) = extracted.anomaly {
        eprintln!("'{}' is malformed: {}", path.display(), anomaly);
        EX_DATAERR.exit();
    }
}

fn resolver_output(config: &SystemConfig, path: &Path) {
    let data = read_input(path);
    let protocol = if config.crypto.enable_smime {
        Protocol::Unknown
    } else {
        Protocol::OpenPgp
    };

    match parse_resolver_output(&String::from_utf8_lossy(&data), protocol) {
        Ok(output) => print!("{}", describe_resolver_output(&output)),
        Err(e @ (ResolveError::Cancelled | ResolveError::Unencrypted)) => {
            println!("{}", e)
        },
        Err(e) => {
            eprintln!("Unusable resolver output: {}", e);
            EX_DATAERR.exit()
        },
    }
}

fn describe_extracted(extracted: &Extracted, html: bool) -> String {
    let mut out = String::new();
    let body = if html {
        extracted.html_body.as_ref().or(extracted.body.as_ref())
    } else {
        extracted.body.as_ref().or(extracted.html_body.as_ref())
    };

    match body {
        Some(body) => {
            let _ = writeln!(out, "Body ({}):", body.charset);
            out.push_str(&body.text);
            if !body.text.ends_with('\n') {
                out.push('\n');
            }
        },
        None => out.push_str("No text body\n"),
    }

    if !extracted.attachments.is_empty() {
        let _ = writeln!(out, "\n{:<32} {:<32} {:>10}", "NAME", "TYPE", "SIZE");
        for attachment in &extracted.attachments {
            let _ = writeln!(
                out,
                "{:<32} {:<32} {:>10}",
                attachment.display_name,
                attachment.content_type,
                attachment.data.len(),
            );
        }
    }

    out
}

fn describe_resolver_output(output: &ResolverOutput) -> String {
    let mut out = format!("protocol: {}\n", output.protocol);
    if let Some(ref signer) = output.signer {
        let _ = writeln!(out, "signer: {}", signer);
    }
    for recipient in &output.recipients {
        let _ = writeln!(out, "recipient: {}", recipient);
    }
    out
}
