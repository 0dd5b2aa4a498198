// Dynamically sized list of doubles.
//
// The record and its data block live on the heap and are addressed
// from emitted IR, so the layout is #[repr(C)] and the data pointer
// is raw. Bounds violations are recoverable: they print one line to
// stderr and yield a neutral value, because a running program is
// allowed to continue past them.

use std::alloc::{alloc_zeroed, dealloc, realloc, Layout};
use std::ptr;

use crate::diagnostic;

// First capacity an empty list grows to on append.
const FIRST_CAPACITY: i64 = 8;

#[repr(C)]
pub struct List {
    pub data: *mut f64,
    pub length: i64,
    pub capacity: i64,
}

fn data_layout(capacity: i64) -> Layout {
    Layout::array::<f64>(capacity as usize).expect("list capacity overflow")
}

/// Allocate a list of `length` zeros. Capacity equals the requested
/// length; growth happens on append. Returns null on allocation
/// failure.
#[no_mangle]
pub extern "C" fn eigen_list_create(length: i64) -> *mut List {
    let length = length.max(0);
    let data = if length == 0 {
        ptr::null_mut()
    } else {
        let raw = unsafe { alloc_zeroed(data_layout(length)) } as *mut f64;
        if raw.is_null() {
            return ptr::null_mut();
        }
        raw
    };
    let record = Box::new(List {
        data,
        length,
        capacity: length,
    });
    Box::into_raw(record)
}

/// # Safety
/// `l` must be null or a pointer obtained from `eigen_list_create`.
#[no_mangle]
pub unsafe extern "C" fn eigen_list_destroy(l: *mut List) {
    if l.is_null() {
        return;
    }
    let record = Box::from_raw(l);
    if !record.data.is_null() {
        dealloc(record.data as *mut u8, data_layout(record.capacity));
    }
}

/// Bounds-checked read. Out of range prints a diagnostic and returns
/// 0.0, leaving the list untouched.
///
/// # Safety
/// `l` must be null or a valid list.
#[no_mangle]
pub unsafe extern "C" fn eigen_list_get(l: *const List, index: i64) -> f64 {
    if l.is_null() {
        diagnostic("list_get", "null list");
        return 0.0;
    }
    let list = &*l;
    if index < 0 || index >= list.length {
        diagnostic(
            "list_get",
            &format!("index {} out of range for length {}", index, list.length),
        );
        return 0.0;
    }
    *list.data.offset(index as isize)
}

/// Bounds-checked write. Out of range prints a diagnostic and is a
/// no-op.
///
/// # Safety
/// `l` must be null or a valid list.
#[no_mangle]
pub unsafe extern "C" fn eigen_list_set(l: *mut List, index: i64, value: f64) {
    if l.is_null() {
        diagnostic("list_set", "null list");
        return;
    }
    let list = &mut *l;
    if index < 0 || index >= list.length {
        diagnostic(
            "list_set",
            &format!("index {} out of range for length {}", index, list.length),
        );
        return;
    }
    *list.data.offset(index as isize) = value;
}

/// # Safety
/// `l` must be null or a valid list.
#[no_mangle]
pub unsafe extern "C" fn eigen_list_length(l: *const List) -> i64 {
    if l.is_null() { 0 } else { (*l).length }
}

/// Append with amortized doubling: capacity goes 0, 8, 16, 32, ...
///
/// # Safety
/// `l` must be null or a valid list.
#[no_mangle]
pub unsafe extern "C" fn eigen_list_append(l: *mut List, value: f64) {
    if l.is_null() {
        diagnostic("list_append", "null list");
        return;
    }
    let list = &mut *l;
    if list.length == list.capacity {
        let grown = if list.capacity == 0 {
            FIRST_CAPACITY
        } else {
            list.capacity * 2
        };
        let raw = if list.data.is_null() {
            alloc_zeroed(data_layout(grown)) as *mut f64
        } else {
            realloc(
                list.data as *mut u8,
                data_layout(list.capacity),
                data_layout(grown).size(),
            ) as *mut f64
        };
        if raw.is_null() {
            diagnostic("list_append", "out of memory");
            return;
        }
        list.data = raw;
        list.capacity = grown;
    }
    *list.data.offset(list.length as isize) = value;
    list.length += 1;
}

// Resolve a possibly-negative slice endpoint against `length`,
// clamping to the valid range.
fn resolve_index(raw: i64, length: i64) -> i64 {
    let adjusted = if raw < 0 { raw + length } else { raw };
    adjusted.clamp(0, length)
}

/// Copy out `[start, end)` with Python-style negative indexing and
/// clamping. `start > end` yields an empty list.
///
/// # Safety
/// `l` must be null or a valid list.
#[no_mangle]
pub unsafe extern "C" fn eigen_list_slice(l: *const List, start: i64, end: i64) -> *mut List {
    if l.is_null() {
        diagnostic("list_slice", "null list");
        return eigen_list_create(0);
    }
    let list = &*l;
    let start = resolve_index(start, list.length);
    let end = resolve_index(end, list.length);
    if start >= end {
        return eigen_list_create(0);
    }
    let out = eigen_list_create(end - start);
    if out.is_null() {
        return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(
        list.data.offset(start as isize),
        (*out).data,
        (end - start) as usize,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn from_values(values: &[f64]) -> *mut List {
        let l = eigen_list_create(0);
        for &v in values {
            unsafe { eigen_list_append(l, v) };
        }
        l
    }

    fn contents(l: *const List) -> Vec<f64> {
        unsafe { (0..eigen_list_length(l)).map(|i| eigen_list_get(l, i)).collect() }
    }

    #[test]
    fn append_preserves_order() {
        let values: Vec<f64> = (0..20).map(|i| i as f64 * 1.5).collect();
        let l = from_values(&values);
        unsafe {
            assert_eq!(eigen_list_length(l), 20);
        }
        assert_eq!(contents(l), values);
        unsafe { eigen_list_destroy(l) };
    }

    #[test]
    fn capacity_doubles_from_eight() {
        let l = eigen_list_create(0);
        unsafe {
            assert_eq!((*l).capacity, 0);
            for i in 0..9 {
                eigen_list_append(l, i as f64);
            }
            assert_eq!((*l).capacity, 16);
            assert_eq!((*l).length, 9);
            eigen_list_destroy(l);
        }
    }

    #[test]
    fn create_zero_fills() {
        let l = eigen_list_create(4);
        assert_eq!(contents(l), vec![0.0; 4]);
        unsafe { eigen_list_destroy(l) };
    }

    #[test]
    fn out_of_bounds_reads_zero_and_leaves_list_alone() {
        let l = from_values(&[1.0, 2.0]);
        unsafe {
            assert_eq!(eigen_list_get(l, 5), 0.0);
            assert_eq!(eigen_list_get(l, -1), 0.0);
            eigen_list_set(l, 7, 9.0);
            assert_eq!((*l).length, 2);
        }
        assert_eq!(contents(l), vec![1.0, 2.0]);
        unsafe { eigen_list_destroy(l) };
    }

    #[test]
    fn slice_follows_python_rules() {
        let l = from_values(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        unsafe {
            let tail = eigen_list_slice(l, -2, 5);
            assert_eq!(contents(tail), vec![3.0, 4.0]);
            eigen_list_destroy(tail);

            let clamped = eigen_list_slice(l, 3, 99);
            assert_eq!(contents(clamped), vec![3.0, 4.0]);
            eigen_list_destroy(clamped);

            let empty = eigen_list_slice(l, 4, 2);
            assert_eq!(contents(empty), Vec::<f64>::new());
            eigen_list_destroy(empty);

            // Whole-range slice reproduces the contents.
            let whole = eigen_list_slice(l, 0, eigen_list_length(l));
            assert_eq!(contents(whole), contents(l));
            eigen_list_destroy(whole);
            eigen_list_destroy(l);
        }
    }
}
