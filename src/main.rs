// EigenScript compiler core.
//
// Copyright (C) 2026 the EigenScript developers
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use eigenscript::config::{EmitKind, OptLevel};
use eigenscript::driver::{Driver, DriverOptions};

// Exit code contract: 0 success, 1 compile/verify, 2 link, 3 usage.
const EXIT_USAGE: u8 = 3;

#[derive(Parser)]
#[command(name = "eigenc")]
#[command(about = "EigenScript compiler: program documents to native executables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program document produced by the front end
    Compile {
        /// Input program document (RON tree from the front end)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output path (defaults to the input stem)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// What to produce
        #[arg(long, value_enum, default_value = "exec")]
        emit: EmitArg,

        /// Optimization level (0-3)
        #[arg(short = 'O', value_name = "LEVEL", default_value = "2")]
        opt: u8,

        /// LLVM target triple (defaults to the host)
        #[arg(long)]
        target: Option<String>,

        /// Verify the emitted module (default on)
        #[arg(long, conflicts_with = "no_verify")]
        verify: bool,

        /// Skip module verification
        #[arg(long = "no-verify")]
        no_verify: bool,

        /// Library mode: emit <module>_init() instead of main
        #[arg(long)]
        library: bool,

        /// Error rendering
        #[arg(long, value_enum, default_value = "human")]
        error_format: ErrorFormat,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EmitArg {
    Ir,
    Obj,
    Exec,
}

impl From<EmitArg> for EmitKind {
    fn from(arg: EmitArg) -> EmitKind {
        match arg {
            EmitArg::Ir => EmitKind::Ir,
            EmitArg::Obj => EmitKind::Object,
            EmitArg::Exec => EmitKind::Executable,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ErrorFormat {
    Human,
    Json,
}

fn opt_level(raw: u8) -> Option<OptLevel> {
    match raw {
        0 => Some(OptLevel::O0),
        1 => Some(OptLevel::O1),
        2 => Some(OptLevel::O2),
        3 => Some(OptLevel::O3),
        _ => None,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders --help/--version through the same path.
            let _ = err.print();
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };

    let Commands::Compile {
        input,
        output,
        emit,
        opt,
        target,
        verify: _,
        no_verify,
        library,
        error_format,
    } = cli.command;

    let Some(opt_level) = opt_level(opt) else {
        eprintln!("eigenc: -O takes 0, 1, 2, or 3");
        return ExitCode::from(EXIT_USAGE);
    };

    let mut opts = DriverOptions::new(input);
    opts.output = output;
    opts.emit = emit.into();
    opts.opt_level = opt_level;
    opts.target = target;
    opts.verify = !no_verify;
    opts.library_mode = library;

    match Driver::new(opts).run() {
        Ok(artifact) => {
            eprintln!("wrote {}", artifact.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            match error_format {
                ErrorFormat::Human => eprintln!("{}", err),
                ErrorFormat::Json => eprintln!("{}", err.to_json()),
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
