// EigenScript runtime library.
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
//
// Everything compiled programs call at run time: the tracked scalar
// and its convergence predicates, lists, strings, matrices, the
// encoded-double bridge for the self-hosted front end, the
// process-wide change tracker, file access, and math forwards. All
// exports use the C ABI with the `eigen_` prefix, and the crate also
// builds as a static archive the link step feeds to the system
// linker.
//
// Memory policy: heap handles are deliberately leaked for the life of
// the process unless the program calls a destroy entry point.
// Emitted programs are short-lived tools; see the compiler's design
// notes.

#[macro_use]
extern crate lazy_static;

pub mod bridge;
pub mod fileio;
pub mod list;
pub mod mathfn;
pub mod matrix;
pub mod strbuf;
pub mod tracked;
pub mod tracker;

// One-line recoverable-failure report, shared by every module.
pub(crate) fn diagnostic(op: &str, cause: &str) {
    eprintln!("{}: {}", op, cause);
}
