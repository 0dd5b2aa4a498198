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
//
// EigenScript compiles a small imperative language in which every
// scalar can carry a geometric history: previous value, gradient,
// stability, and a bounded ring of recent readings, queryable with
// interrogatives (`what is x`) and convergence predicates
// (`x is converged`). The front end (lexer, parser, resolver) is an
// external collaborator; this crate consumes its serialized tree and
// produces textual LLVM IR, then drives verification, optimization,
// and linking against the runtime library in the sibling
// `eigenscript-runtime` crate.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod driver;
pub mod error;
pub mod ir;
pub mod pipeline;
