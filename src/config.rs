// Compilation configuration shared by the code generator, the
// pipeline, and the driver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptLevel {
    O0,
    O1,
    #[default]
    O2,
    O3,
}

impl OptLevel {
    // Pipeline-tuning knobs keyed by level. Size optimization is
    // never requested; this compiler tunes for speed only.
    pub fn speed_level(self) -> u32 {
        match self {
            OptLevel::O0 => 0,
            OptLevel::O1 => 1,
            OptLevel::O2 => 2,
            OptLevel::O3 => 3,
        }
    }

    pub fn size_level(self) -> u32 {
        0
    }

    pub fn inline_threshold(self) -> u32 {
        match self {
            OptLevel::O0 => 0,
            OptLevel::O1 => 75,
            OptLevel::O2 => 225,
            OptLevel::O3 => 375,
        }
    }

    // Vectorization, unrolling, and interleaving switch on together.
    pub fn vectorize(self) -> bool {
        self >= OptLevel::O2
    }
}

// How far the pipeline runs before stopping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmitKind {
    Ir,
    Object,
    #[default]
    Executable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodegenOptions {
    pub module_name: String,
    // Names the resolver found under an interrogative or a scoped
    // predicate; these compile on the geometric path.
    pub observed_variables: BTreeSet<String>,
    pub target_triple: String,
    // Library mode: no main; top-level statements become
    // <module>_init() with external linkage.
    pub library_mode: bool,
    pub opt_level: OptLevel,
}

impl CodegenOptions {
    pub fn new(module_name: &str) -> CodegenOptions {
        CodegenOptions {
            module_name: String::from(module_name),
            observed_variables: BTreeSet::new(),
            target_triple: host_triple(),
            library_mode: false,
            opt_level: OptLevel::default(),
        }
    }

}

// Best-effort triple for the machine the compiler is running on.
// `--target` overrides this.
pub fn host_triple() -> String {
    let arch = std::env::consts::ARCH;
    match std::env::consts::OS {
        "linux" => format!("{}-unknown-linux-gnu", arch),
        "macos" => format!("{}-apple-darwin", arch),
        "windows" => format!("{}-pc-windows-msvc", arch),
        other => format!("{}-unknown-{}", arch, other),
    }
}
