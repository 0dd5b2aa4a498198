// Growable byte string with a C-visible record. The buffer always
// holds a trailing NUL so `data` can be handed to libc-shaped
// consumers directly.

use std::alloc::{alloc, dealloc, realloc, Layout};
use std::os::raw::c_char;
use std::ptr;

use crate::diagnostic;

// Smallest buffer we ever allocate.
const MIN_CAPACITY: i64 = 16;

#[repr(C)]
pub struct Str {
    pub data: *mut c_char,
    pub length: i64,
    pub capacity: i64,
}

fn buffer_layout(capacity: i64) -> Layout {
    Layout::array::<u8>(capacity as usize).expect("string capacity overflow")
}

fn alloc_record(capacity: i64) -> *mut Str {
    let capacity = capacity.max(MIN_CAPACITY);
    let data = unsafe { alloc(buffer_layout(capacity)) } as *mut c_char;
    if data.is_null() {
        return ptr::null_mut();
    }
    unsafe { *data = 0 };
    Box::into_raw(Box::new(Str {
        data,
        length: 0,
        capacity,
    }))
}

/// Build a string from `bytes`, copying them into a fresh buffer.
pub fn from_bytes(bytes: &[u8]) -> *mut Str {
    let record = alloc_record(bytes.len() as i64 + 1);
    if record.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), (*record).data as *mut u8, bytes.len());
        (*record).length = bytes.len() as i64;
        *(*record).data.offset(bytes.len() as isize) = 0;
    }
    record
}

/// View the bytes of a possibly-null string record.
///
/// # Safety
/// `s` must be null or a valid string record.
pub unsafe fn as_bytes<'a>(s: *const Str) -> &'a [u8] {
    if s.is_null() || (*s).data.is_null() {
        return &[];
    }
    std::slice::from_raw_parts((*s).data as *const u8, (*s).length as usize)
}

/// # Safety
/// `cstr` must be null or a NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_from_cstr(cstr: *const c_char) -> *mut Str {
    if cstr.is_null() {
        return from_bytes(&[]);
    }
    let bytes = std::ffi::CStr::from_ptr(cstr).to_bytes();
    from_bytes(bytes)
}

/// Empty string with at least `capacity` bytes of buffer.
#[no_mangle]
pub extern "C" fn eigen_string_empty(capacity: i64) -> *mut Str {
    alloc_record(capacity)
}

/// # Safety
/// `s` must be null or a pointer obtained from this module.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_destroy(s: *mut Str) {
    if s.is_null() {
        return;
    }
    let record = Box::from_raw(s);
    if !record.data.is_null() {
        dealloc(record.data as *mut u8, buffer_layout(record.capacity));
    }
}

/// # Safety
/// `s` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_length(s: *const Str) -> i64 {
    if s.is_null() { 0 } else { (*s).length }
}

/// Byte at `index`, or -1 when out of range.
///
/// # Safety
/// `s` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_char_at(s: *const Str, index: i64) -> i64 {
    if s.is_null() || index < 0 || index >= (*s).length {
        return -1;
    }
    *(*s).data.offset(index as isize) as u8 as i64
}

/// Substring of `len` bytes starting at `start`. A start at or past
/// the end yields the empty string; a length past the end clamps.
///
/// # Safety
/// `s` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_substring(s: *const Str, start: i64, len: i64) -> *mut Str {
    let bytes = as_bytes(s);
    let total = bytes.len() as i64;
    let start = start.clamp(0, total);
    let end = (start + len.max(0)).clamp(start, total);
    from_bytes(&bytes[start as usize..end as usize])
}

/// # Safety
/// Both arguments must be null or valid string records.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_concat(a: *const Str, b: *const Str) -> *mut Str {
    let mut joined = Vec::with_capacity((as_bytes(a).len() + as_bytes(b).len()).max(1));
    joined.extend_from_slice(as_bytes(a));
    joined.extend_from_slice(as_bytes(b));
    from_bytes(&joined)
}

/// Append one byte, doubling the buffer when full.
///
/// # Safety
/// `s` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_append_char(s: *mut Str, ch: i64) {
    if s.is_null() {
        diagnostic("string_append_char", "null string");
        return;
    }
    let record = &mut *s;
    // Room for the byte plus the terminator.
    if record.length + 2 > record.capacity {
        let grown = record.capacity * 2;
        let raw = realloc(
            record.data as *mut u8,
            buffer_layout(record.capacity),
            buffer_layout(grown).size(),
        ) as *mut c_char;
        if raw.is_null() {
            diagnostic("string_append_char", "out of memory");
            return;
        }
        record.data = raw;
        record.capacity = grown;
    }
    *record.data.offset(record.length as isize) = ch as u8 as c_char;
    record.length += 1;
    *record.data.offset(record.length as isize) = 0;
}

/// Lexicographic comparison: -1, 0, or 1.
///
/// # Safety
/// Both arguments must be null or valid string records.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_compare(a: *const Str, b: *const Str) -> i64 {
    match as_bytes(a).cmp(as_bytes(b)) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// # Safety
/// Both arguments must be null or valid string records.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_equals(a: *const Str, b: *const Str) -> i64 {
    (as_bytes(a) == as_bytes(b)) as i64
}

/// Byte index of `needle` in `hay` at or after `start`, or -1.
///
/// # Safety
/// Both string arguments must be null or valid string records.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_find(hay: *const Str, needle: *const Str, start: i64) -> i64 {
    let hay = as_bytes(hay);
    let needle = as_bytes(needle);
    let start = start.clamp(0, hay.len() as i64) as usize;
    if needle.is_empty() {
        return start as i64;
    }
    hay[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map_or(-1, |p| (start + p) as i64)
}

// Character classifiers take and return doubles so the emitted IR
// can use them without conversions.
macro_rules! classifier {
    ($($export:ident => $test:expr),+ $(,)?) => {$(
        #[no_mangle]
        pub extern "C" fn $export(ch: f64) -> f64 {
            let code = ch as i64;
            let ok = u8::try_from(code).map($test).unwrap_or(false);
            if ok { 1.0 } else { 0.0 }
        }
    )+}
}

classifier! {
    eigen_is_digit => |c: u8| c.is_ascii_digit(),
    eigen_is_alpha => |c: u8| c.is_ascii_alphabetic(),
    eigen_is_alnum => |c: u8| c.is_ascii_alphanumeric(),
    eigen_is_whitespace => |c: u8| c.is_ascii_whitespace(),
    eigen_is_newline => |c: u8| c == b'\n',
}

/// One-byte string from a character code.
#[no_mangle]
pub extern "C" fn eigen_char_to_string(ch: f64) -> *mut Str {
    from_bytes(&[ch as i64 as u8])
}

// True when `v` prints exactly as an integer. The bound is inclusive
// so the whole exactly-representable range round-trips through
// string form.
fn integer_valued(v: f64) -> bool {
    v == v.trunc() && v.abs() <= 9007199254740992.0 // 2^53
}

/// Render a double the way the language prints it: integers without
/// a decimal point, everything else with 15 significant digits.
pub fn format_number(v: f64) -> String {
    if v.is_nan() {
        return String::from("nan");
    }
    if v.is_infinite() {
        return String::from(if v > 0.0 { "inf" } else { "-inf" });
    }
    if integer_valued(v) {
        return format!("{}", v as i64);
    }
    format_sig(v, 15)
}

// %.<sig>g rendering: fixed notation while the exponent sits in
// [-4, sig), scientific otherwise, trailing zeros trimmed, two-digit
// signed exponent.
fn format_sig(v: f64, sig: usize) -> String {
    let exp_form = format!("{:.*e}", sig - 1, v);
    let (mantissa, exponent) = exp_form
        .split_once('e')
        .expect("exponential format always contains 'e'");
    let exponent: i32 = exponent.parse().expect("exponent is an integer");

    if exponent >= -4 && exponent < sig as i32 {
        let decimals = (sig as i32 - 1 - exponent).max(0) as usize;
        let fixed = format!("{:.*}", decimals, v);
        trim_zeros(&fixed)
    } else {
        let mantissa = trim_zeros(mantissa);
        format!("{}e{}{:02}", mantissa, if exponent < 0 { '-' } else { '+' }, exponent.abs())
    }
}

fn trim_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// String form of a number, integer fast path included.
#[no_mangle]
pub extern "C" fn eigen_number_to_string(v: f64) -> *mut Str {
    from_bytes(format_number(v).as_bytes())
}

/// Parse a whole string as a number. Partial parses do not count:
/// anything short of a full parse yields NaN.
///
/// # Safety
/// `s` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_string_to_number(s: *const Str) -> f64 {
    let text = match std::str::from_utf8(as_bytes(s)) {
        Ok(t) => t.trim(),
        Err(_) => return f64::NAN,
    };
    text.parse::<f64>().unwrap_or(f64::NAN)
}
