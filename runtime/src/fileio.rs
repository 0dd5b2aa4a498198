// File access and program arguments. Failures are reported to the
// running program as neutral values (null handle or 0.0), never as
// aborts: emitted programs are expected to check and carry on.

use std::fs;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Mutex;

use crate::bridge::encode;
use crate::diagnostic;
use crate::strbuf::{self, Str};

fn path_of(s: *const Str) -> Option<String> {
    let bytes = unsafe { strbuf::as_bytes(s) };
    match std::str::from_utf8(bytes) {
        Ok(p) if !p.is_empty() => Some(p.to_string()),
        _ => None,
    }
}

/// Whole-file read. Returns a fresh string handle, or null when the
/// path is bad or unreadable.
///
/// # Safety
/// `path` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_file_read(path: *const Str) -> *mut Str {
    let Some(path) = path_of(path) else {
        diagnostic("file_read", "invalid path");
        return std::ptr::null_mut();
    };
    match fs::read(&path) {
        Ok(bytes) => strbuf::from_bytes(&bytes),
        Err(err) => {
            diagnostic("file_read", &format!("{}: {}", path, err));
            std::ptr::null_mut()
        }
    }
}

/// Overwrite `path` with `content`. 1.0 on success, 0.0 on failure.
///
/// # Safety
/// Both arguments must be null or valid string records.
#[no_mangle]
pub unsafe extern "C" fn eigen_file_write(path: *const Str, content: *const Str) -> f64 {
    let Some(path) = path_of(path) else {
        diagnostic("file_write", "invalid path");
        return 0.0;
    };
    match fs::write(&path, strbuf::as_bytes(content)) {
        Ok(()) => 1.0,
        Err(err) => {
            diagnostic("file_write", &format!("{}: {}", path, err));
            0.0
        }
    }
}

/// Append `content` to `path`, creating it if missing.
///
/// # Safety
/// Both arguments must be null or valid string records.
#[no_mangle]
pub unsafe extern "C" fn eigen_file_append(path: *const Str, content: *const Str) -> f64 {
    use std::io::Write;
    let Some(path) = path_of(path) else {
        diagnostic("file_append", "invalid path");
        return 0.0;
    };
    let opened = fs::OpenOptions::new().create(true).append(true).open(&path);
    match opened.and_then(|mut f| f.write_all(strbuf::as_bytes(content))) {
        Ok(()) => 1.0,
        Err(err) => {
            diagnostic("file_append", &format!("{}: {}", path, err));
            0.0
        }
    }
}

/// # Safety
/// `path` must be null or a valid string record.
#[no_mangle]
pub unsafe extern "C" fn eigen_file_exists(path: *const Str) -> f64 {
    match path_of(path) {
        Some(p) if Path::new(&p).exists() => 1.0,
        _ => 0.0,
    }
}

lazy_static! {
    static ref ARGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
}

/// Capture the process arguments. The emitted `main` calls this once
/// before anything else runs.
///
/// # Safety
/// `argv` must point at `argc` NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn eigen_init_args(argc: i32, argv: *const *const c_char) {
    let mut captured = Vec::with_capacity(argc.max(0) as usize);
    for i in 0..argc.max(0) {
        let entry = *argv.offset(i as isize);
        if entry.is_null() {
            continue;
        }
        let text = std::ffi::CStr::from_ptr(entry).to_string_lossy().into_owned();
        captured.push(text);
    }
    *ARGS.lock().expect("args lock poisoned") = captured;
}

#[no_mangle]
pub extern "C" fn eigen_get_argc() -> f64 {
    ARGS.lock().expect("args lock poisoned").len() as f64
}

/// Argument `i` as an encoded string handle; null handle when out of
/// range.
#[no_mangle]
pub extern "C" fn eigen_get_arg(index: f64) -> f64 {
    let args = ARGS.lock().expect("args lock poisoned");
    let i = index as i64;
    if i < 0 || i >= args.len() as i64 {
        return encode::<Str>(std::ptr::null_mut());
    }
    encode(strbuf::from_bytes(args[i as usize].as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::decode;

    fn s(text: &str) -> *mut Str {
        strbuf::from_bytes(text.as_bytes())
    }

    #[test]
    fn read_back_what_was_written() {
        let dir = std::env::temp_dir().join("eigen-fileio-test");
        let _ = fs::create_dir_all(&dir);
        let file = dir.join("roundtrip.txt");
        let path = s(file.to_str().unwrap());
        let content = s("one\ntwo\n");
        unsafe {
            assert_eq!(eigen_file_write(path, content), 1.0);
            assert_eq!(eigen_file_exists(path), 1.0);
            let read = eigen_file_read(path);
            assert_eq!(strbuf::eigen_string_equals(read, content), 1);

            assert_eq!(eigen_file_append(path, content), 1.0);
            let doubled = eigen_file_read(path);
            assert_eq!(strbuf::eigen_string_length(doubled), 16);

            for p in [path, content, read, doubled] {
                strbuf::eigen_string_destroy(p);
            }
        }
        let _ = fs::remove_file(&file);
    }

    #[test]
    fn missing_file_reads_null() {
        let path = s("/nonexistent/eigen/definitely-not-here");
        unsafe {
            assert_eq!(eigen_file_exists(path), 0.0);
            assert!(eigen_file_read(path).is_null());
            strbuf::eigen_string_destroy(path);
        }
    }

    #[test]
    fn argv_capture() {
        let one = std::ffi::CString::new("prog").unwrap();
        let two = std::ffi::CString::new("input.es").unwrap();
        let argv = [one.as_ptr(), two.as_ptr()];
        unsafe { eigen_init_args(2, argv.as_ptr()) };
        assert_eq!(eigen_get_argc(), 2.0);

        let arg = eigen_get_arg(1.0);
        let handle = decode::<Str>(arg);
        unsafe {
            assert_eq!(strbuf::as_bytes(handle), b"input.es");
            strbuf::eigen_string_destroy(handle);
        }
        assert!(decode::<Str>(eigen_get_arg(9.0)).is_null());
    }
}
