// The error taxonomy the driver reports. Syntax and semantic errors
// originate in the excluded front end and pass through; the rest are
// raised here. Every kind carries a message, an optional source
// location, and an optional hint.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::ast::SourceLoc;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<SourceLoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            message: message.into(),
            ..Diagnostic::default()
        }
    }

    pub fn at(mut self, loc: SourceLoc) -> Diagnostic {
        self.loc = Some(loc);
        self
    }

    pub fn in_file(mut self, file: impl Into<PathBuf>) -> Diagnostic {
        self.file = Some(file.into());
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Diagnostic {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}:", file.display())?;
        }
        if let Some(loc) = self.loc {
            write!(f, "{}:{}: ", loc.line, loc.col)?;
        } else if self.file.is_some() {
            write!(f, " ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("syntax error: {0}")]
    Syntax(Diagnostic),
    #[error("semantic error: {0}")]
    Semantic(Diagnostic),
    #[error("compile error: {0}")]
    Compile(Diagnostic),
    #[error("verify error: {0}")]
    Verify(Diagnostic),
    #[error("link error: {0}")]
    Link(Diagnostic),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            Error::Syntax(d)
            | Error::Semantic(d)
            | Error::Compile(d)
            | Error::Verify(d)
            | Error::Link(d) => d,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::Syntax(_) => "syntax",
            Error::Semantic(_) => "semantic",
            Error::Compile(_) => "compile",
            Error::Verify(_) => "verify",
            Error::Link(_) => "link",
        }
    }

    // Process exit code contract: 1 for anything that stops
    // compilation, 2 when the external link step failed. Usage
    // errors exit 3 before an Error ever exists.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Link(_) => 2,
            _ => 1,
        }
    }

    // Machine-readable rendering for --error-format json.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "diagnostic": self.diagnostic(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_rendering_includes_location_and_hint() {
        let err = Error::Compile(
            Diagnostic::new("unknown name `speed`")
                .in_file("sim.es")
                .at(SourceLoc::new(4, 9))
                .hint("assign it before use"),
        );
        let text = err.to_string();
        assert_eq!(
            text,
            "compile error: sim.es:4:9: unknown name `speed`\n  hint: assign it before use"
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Error::Verify(Diagnostic::new("bad ir")).exit_code(), 1);
        assert_eq!(Error::Link(Diagnostic::new("cc failed")).exit_code(), 2);
    }

    #[test]
    fn json_rendering_names_the_kind() {
        let err = Error::Link(Diagnostic::new("undefined symbol"));
        let value = err.to_json();
        assert_eq!(value["error"], "link");
        assert_eq!(value["diagnostic"]["message"], "undefined symbol");
    }
}
