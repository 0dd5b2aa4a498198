// Textual-IR building blocks: constant formatting, string escaping,
// name mangling, function-attribute sets, and the table of runtime
// symbols the emitter may reference. The code generator records
// which table entries it touched and only those declarations are
// printed into the module.

use enumflags2::{bitflags, BitFlags};
use lazy_static::lazy_static;
use regex::Regex;

// Layout of the tracked scalar as the IR sees it. Must match the
// runtime's #[repr(C)] record field for field.
pub const TRACKED_TYPEDEF: &str =
    "%eigen.tracked = type { double, double, double, i64, double, double, [100 x double], i32, i32 }";

// Exact bit pattern of a double constant. Hex form sidesteps every
// decimal round-trip concern, NaN and infinities included.
pub fn double_constant(v: f64) -> String {
    format!("0x{:016X}", v.to_bits())
}

// Escape rules for the bytes of a constant array: printable ASCII
// passes through, quote and backslash and everything else become
// \HH with uppercase hex digits. The declared array length counts
// unescaped bytes.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'"' | b'\\' => out.push_str(&format!("\\{:02X}", b)),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\{:02X}", b)),
        }
    }
    out
}

lazy_static! {
    static ref PLAIN_IDENT: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

// Make an arbitrary front-end name safe inside an LLVM identifier.
// Ordinary identifiers pass through; anything else is hex-escaped
// byte by byte.
pub fn sanitize(name: &str) -> String {
    if PLAIN_IDENT.is_match(name) {
        return String::from(name);
    }
    name.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => (b as char).to_string(),
            _ => format!("_{:02X}", b),
        })
        .collect()
}

// Top-level names share one global namespace across modules.
pub fn global_symbol(name: &str) -> String {
    format!("@__eigs_global_{}", sanitize(name))
}

// User functions are mangled <module>_<fn>.
pub fn function_symbol(module: &str, name: &str) -> String {
    format!("@{}_{}", sanitize(module), sanitize(name))
}

pub fn init_symbol(module: &str) -> String {
    format!("@{}_init", sanitize(module))
}

#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Attr {
    NoUnwind = 0b001,
    ReadOnly = 0b010,
    AlwaysInline = 0b100,
}

pub type AttrSet = BitFlags<Attr>;

// Fixed rendering order keeps emitted modules byte-stable.
pub fn render_attrs(set: AttrSet) -> String {
    let mut words = Vec::new();
    if set.contains(Attr::AlwaysInline) {
        words.push("alwaysinline");
    }
    if set.contains(Attr::NoUnwind) {
        words.push("nounwind");
    }
    if set.contains(Attr::ReadOnly) {
        words.push("readonly");
    }
    words.join(" ")
}

// The runtime ABI as the emitter knows it: symbol, return type,
// parameter types, attribute set. Signatures mirror the runtime
// crate's exports exactly.
macro_rules! runtime_table {
    ($($variant:ident => $sym:literal, $ret:literal, $params:literal, $attrs:expr;)+) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
        pub enum RuntimeFn {
            $($variant),+
        }

        impl RuntimeFn {
            pub fn symbol(self) -> &'static str {
                match self {
                    $(RuntimeFn::$variant => $sym),+
                }
            }

            pub fn ret(self) -> &'static str {
                match self {
                    $(RuntimeFn::$variant => $ret),+
                }
            }

            pub fn params(self) -> &'static str {
                match self {
                    $(RuntimeFn::$variant => $params),+
                }
            }

            pub fn attrs(self) -> AttrSet {
                match self {
                    $(RuntimeFn::$variant => $attrs),+
                }
            }
        }
    }
}

runtime_table! {
    TrackedCreate => "eigen_tracked_create", "ptr", "double", Attr::NoUnwind.into();
    TrackedInit => "eigen_tracked_init", "void", "ptr, double", Attr::AlwaysInline | Attr::NoUnwind;
    TrackedUpdate => "eigen_tracked_update", "void", "ptr, double", Attr::NoUnwind.into();
    TrackedValue => "eigen_tracked_value", "double", "ptr", Attr::AlwaysInline | Attr::NoUnwind | Attr::ReadOnly;
    TrackedGradient => "eigen_tracked_gradient", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    TrackedStability => "eigen_tracked_stability", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    TrackedIteration => "eigen_tracked_iteration", "i64", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    CheckConverged => "eigen_check_converged", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    CheckDiverging => "eigen_check_diverging", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    CheckOscillating => "eigen_check_oscillating", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    CheckStable => "eigen_check_stable", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    CheckImproving => "eigen_check_improving", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;

    ListCreate => "eigen_list_create", "ptr", "i64", Attr::NoUnwind.into();
    ListGet => "eigen_list_get", "double", "ptr, i64", Attr::NoUnwind.into();
    ListSet => "eigen_list_set", "void", "ptr, i64, double", Attr::NoUnwind.into();
    ListLength => "eigen_list_length", "i64", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    ListAppend => "eigen_list_append", "void", "ptr, double", Attr::NoUnwind.into();
    ListSlice => "eigen_list_slice", "ptr", "ptr, i64, i64", Attr::NoUnwind.into();

    StringFromCstr => "eigen_string_from_cstr", "ptr", "ptr", Attr::NoUnwind.into();
    StringLength => "eigen_string_length", "i64", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    StringCharAt => "eigen_string_char_at", "i64", "ptr, i64", Attr::NoUnwind | Attr::ReadOnly;
    StringSubstring => "eigen_string_substring", "ptr", "ptr, i64, i64", Attr::NoUnwind.into();
    StringConcat => "eigen_string_concat", "ptr", "ptr, ptr", Attr::NoUnwind.into();
    StringEquals => "eigen_string_equals", "i64", "ptr, ptr", Attr::NoUnwind | Attr::ReadOnly;
    StringCompare => "eigen_string_compare", "i64", "ptr, ptr", Attr::NoUnwind | Attr::ReadOnly;
    StringFind => "eigen_string_find", "i64", "ptr, ptr, i64", Attr::NoUnwind | Attr::ReadOnly;
    NumberToString => "eigen_number_to_string", "ptr", "double", Attr::NoUnwind.into();
    StringToNumber => "eigen_string_to_number", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    CharToString => "eigen_char_to_string", "ptr", "double", Attr::NoUnwind.into();
    IsDigit => "eigen_is_digit", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    IsAlpha => "eigen_is_alpha", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    IsAlnum => "eigen_is_alnum", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    IsWhitespace => "eigen_is_whitespace", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    IsNewline => "eigen_is_newline", "double", "double", Attr::NoUnwind | Attr::ReadOnly;

    MatrixCreate => "eigen_matrix_create", "ptr", "i64, i64", Attr::NoUnwind.into();
    MatrixZeros => "eigen_matrix_zeros", "ptr", "i64, i64", Attr::NoUnwind.into();
    MatrixOnes => "eigen_matrix_ones", "ptr", "i64, i64", Attr::NoUnwind.into();
    MatrixIdentity => "eigen_matrix_identity", "ptr", "i64", Attr::NoUnwind.into();
    MatrixRandom => "eigen_matrix_random", "ptr", "i64, i64", Attr::NoUnwind.into();
    MatrixSeed => "eigen_matrix_seed", "void", "i64", Attr::NoUnwind.into();
    MatrixShape => "eigen_matrix_shape", "ptr", "ptr", Attr::NoUnwind.into();
    MatrixTranspose => "eigen_matrix_transpose", "ptr", "ptr", Attr::NoUnwind.into();
    MatrixAdd => "eigen_matrix_add", "ptr", "ptr, ptr", Attr::NoUnwind.into();
    MatrixScale => "eigen_matrix_scale", "ptr", "ptr, double", Attr::NoUnwind.into();
    MatrixMatmul => "eigen_matrix_matmul", "ptr", "ptr, ptr", Attr::NoUnwind.into();
    MatrixSum => "eigen_matrix_sum", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    MatrixMean => "eigen_matrix_mean", "double", "ptr", Attr::NoUnwind | Attr::ReadOnly;
    MatrixReshape => "eigen_matrix_reshape", "ptr", "ptr, i64, i64", Attr::NoUnwind.into();
    MatrixSlice => "eigen_matrix_slice", "ptr", "ptr, i64, i64", Attr::NoUnwind.into();
    MatrixConcat => "eigen_matrix_concat", "ptr", "ptr, ptr", Attr::NoUnwind.into();
    MatrixRelu => "eigen_matrix_relu", "ptr", "ptr", Attr::NoUnwind.into();
    MatrixGelu => "eigen_matrix_gelu", "ptr", "ptr", Attr::NoUnwind.into();
    MatrixSoftmax => "eigen_matrix_softmax", "ptr", "ptr", Attr::NoUnwind.into();
    MatrixLayerNorm => "eigen_matrix_layer_norm", "ptr", "ptr", Attr::NoUnwind.into();
    MatrixEmbeddingLookup => "eigen_matrix_embedding_lookup", "ptr", "ptr, ptr", Attr::NoUnwind.into();
    MatrixSinusoidalPe => "eigen_matrix_sinusoidal_pe", "ptr", "i64, i64", Attr::NoUnwind.into();
    MatrixCausalMask => "eigen_matrix_causal_mask", "ptr", "i64", Attr::NoUnwind.into();

    Sqrt => "eigen_sqrt", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Abs => "eigen_abs", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Pow => "eigen_pow", "double", "double, double", Attr::NoUnwind | Attr::ReadOnly;
    Log => "eigen_log", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Exp => "eigen_exp", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Sin => "eigen_sin", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Cos => "eigen_cos", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Tan => "eigen_tan", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Floor => "eigen_floor", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Ceil => "eigen_ceil", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    Round => "eigen_round", "double", "double", Attr::NoUnwind | Attr::ReadOnly;

    PrintVal => "eigen_print_val", "void", "double", Attr::NoUnwind.into();
    PrintString => "eigen_print_string", "void", "ptr", Attr::NoUnwind.into();
    PrintDouble => "eigen_print_double", "void", "double", Attr::NoUnwind.into();
    PrintNewline => "eigen_print_newline", "void", "", Attr::NoUnwind.into();
    FileRead => "eigen_file_read", "ptr", "ptr", Attr::NoUnwind.into();
    FileWrite => "eigen_file_write", "double", "ptr, ptr", Attr::NoUnwind.into();
    FileAppend => "eigen_file_append", "double", "ptr, ptr", Attr::NoUnwind.into();
    FileExists => "eigen_file_exists", "double", "ptr", Attr::NoUnwind.into();
    InitArgs => "eigen_init_args", "void", "i32, ptr", Attr::NoUnwind.into();
    GetArgc => "eigen_get_argc", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    GetArg => "eigen_get_arg", "double", "double", Attr::NoUnwind.into();

    TrackValue => "eigen_track_value", "void", "double", Attr::NoUnwind.into();
    IsConverged => "eigen_is_converged", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsStable => "eigen_is_stable", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsDiverging => "eigen_is_diverging", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsOscillating => "eigen_is_oscillating", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsImproving => "eigen_is_improving", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsEquilibrium => "eigen_is_equilibrium", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsStuck => "eigen_is_stuck", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsChaotic => "eigen_is_chaotic", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsSettled => "eigen_is_settled", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    IsBalanced => "eigen_is_balanced", "double", "", Attr::NoUnwind | Attr::ReadOnly;
    WasIs => "eigen_was_is", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    ChangeIs => "eigen_change_is", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
    TrendIs => "eigen_trend_is", "double", "double", Attr::NoUnwind | Attr::ReadOnly;
}

impl RuntimeFn {
    pub fn declaration(self, attr_group: usize) -> String {
        format!(
            "declare {} @{}({}) #{}",
            self.ret(),
            self.symbol(),
            self.params(),
            attr_group
        )
    }
}
