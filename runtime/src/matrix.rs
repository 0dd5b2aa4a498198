// Row-major matrix of doubles plus the small neural-network toolkit
// the language ships with. Every operation that yields a matrix
// allocates a fresh one; arguments are never written through.
// Dimension mismatches are recoverable: a diagnostic line and a null
// handle, which downstream operations tolerate.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::Mutex;

use crate::diagnostic;
use crate::list::{eigen_list_create, eigen_list_set, List};

#[repr(C)]
pub struct Matrix {
    pub data: *mut f64,
    pub rows: i64,
    pub cols: i64,
    pub capacity: i64,
}

// Knuth's MMIX constants. The stream is process-wide state: the same
// sequence of calls yields the same matrices within one run.
const LCG_MULTIPLIER: u64 = 6364136223846793005;
const LCG_INCREMENT: u64 = 1442695040888963407;
const DEFAULT_SEED: u64 = 0x5eed;

pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Lcg {
        Lcg { state: seed }
    }

    // Uniform in [0, 1), from the top 31 bits of the state.
    pub fn next_f64(&mut self) -> f64 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        (self.state >> 33) as f64 / (1u64 << 31) as f64
    }
}

lazy_static! {
    static ref RNG: Mutex<Lcg> = Mutex::new(Lcg::new(DEFAULT_SEED));
}

fn cell_layout(capacity: i64) -> Layout {
    Layout::array::<f64>(capacity as usize).expect("matrix capacity overflow")
}

// Fresh zeroed matrix, or null when the shape is degenerate or the
// allocator fails.
fn alloc_matrix(rows: i64, cols: i64) -> *mut Matrix {
    if rows <= 0 || cols <= 0 {
        diagnostic("matrix_create", &format!("invalid shape {}x{}", rows, cols));
        return ptr::null_mut();
    }
    let capacity = rows * cols;
    let data = unsafe { alloc_zeroed(cell_layout(capacity)) } as *mut f64;
    if data.is_null() {
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(Matrix {
        data,
        rows,
        cols,
        capacity,
    }))
}

unsafe fn cells<'a>(m: *const Matrix) -> &'a [f64] {
    std::slice::from_raw_parts((*m).data, ((*m).rows * (*m).cols) as usize)
}

unsafe fn cells_mut<'a>(m: *mut Matrix) -> &'a mut [f64] {
    std::slice::from_raw_parts_mut((*m).data, ((*m).rows * (*m).cols) as usize)
}

// Build a matrix by evaluating `f` at every (row, col).
fn build(rows: i64, cols: i64, mut f: impl FnMut(i64, i64) -> f64) -> *mut Matrix {
    let m = alloc_matrix(rows, cols);
    if m.is_null() {
        return m;
    }
    let out = unsafe { cells_mut(m) };
    for r in 0..rows {
        for c in 0..cols {
            out[(r * cols + c) as usize] = f(r, c);
        }
    }
    m
}

#[no_mangle]
pub extern "C" fn eigen_matrix_create(rows: i64, cols: i64) -> *mut Matrix {
    alloc_matrix(rows, cols)
}

#[no_mangle]
pub extern "C" fn eigen_matrix_zeros(rows: i64, cols: i64) -> *mut Matrix {
    alloc_matrix(rows, cols)
}

#[no_mangle]
pub extern "C" fn eigen_matrix_ones(rows: i64, cols: i64) -> *mut Matrix {
    build(rows, cols, |_, _| 1.0)
}

#[no_mangle]
pub extern "C" fn eigen_matrix_identity(n: i64) -> *mut Matrix {
    build(n, n, |r, c| if r == c { 1.0 } else { 0.0 })
}

/// Uniform [0, 1) entries drawn from the process-wide generator.
#[no_mangle]
pub extern "C" fn eigen_matrix_random(rows: i64, cols: i64) -> *mut Matrix {
    let mut rng = RNG.lock().expect("rng lock poisoned");
    build(rows, cols, |_, _| rng.next_f64())
}

/// Reset the process-wide generator, pinning the stream for
/// reproducible runs.
#[no_mangle]
pub extern "C" fn eigen_matrix_seed(seed: u64) {
    *RNG.lock().expect("rng lock poisoned") = Lcg::new(seed);
}

/// # Safety
/// `m` must be null or a pointer obtained from this module.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_destroy(m: *mut Matrix) {
    if m.is_null() {
        return;
    }
    let record = Box::from_raw(m);
    if !record.data.is_null() {
        dealloc(record.data as *mut u8, cell_layout(record.capacity));
    }
}

/// Two-element list [rows, cols].
///
/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_shape(m: *const Matrix) -> *mut List {
    let shape = eigen_list_create(2);
    if m.is_null() || shape.is_null() {
        return shape;
    }
    eigen_list_set(shape, 0, (*m).rows as f64);
    eigen_list_set(shape, 1, (*m).cols as f64);
    shape
}

/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_transpose(m: *const Matrix) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols;
    build((*m).cols, (*m).rows, |r, c| src[(c * cols + r) as usize])
}

/// Elementwise sum; shapes must match exactly.
///
/// # Safety
/// Both arguments must be null or valid matrices.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_add(a: *const Matrix, b: *const Matrix) -> *mut Matrix {
    if a.is_null() || b.is_null() {
        return ptr::null_mut();
    }
    if (*a).rows != (*b).rows || (*a).cols != (*b).cols {
        diagnostic(
            "matrix_add",
            &format!(
                "shape mismatch {}x{} vs {}x{}",
                (*a).rows,
                (*a).cols,
                (*b).rows,
                (*b).cols
            ),
        );
        return ptr::null_mut();
    }
    let (lhs, rhs) = (cells(a), cells(b));
    let cols = (*a).cols;
    build((*a).rows, cols, |r, c| {
        let i = (r * cols + c) as usize;
        lhs[i] + rhs[i]
    })
}

/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_scale(m: *const Matrix, k: f64) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols;
    build((*m).rows, cols, |r, c| src[(r * cols + c) as usize] * k)
}

/// Matrix product. Returns null when the inner dimensions disagree.
///
/// # Safety
/// Both arguments must be null or valid matrices.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_matmul(a: *const Matrix, b: *const Matrix) -> *mut Matrix {
    if a.is_null() || b.is_null() {
        return ptr::null_mut();
    }
    if (*a).cols != (*b).rows {
        diagnostic(
            "matrix_matmul",
            &format!("inner dimensions {} vs {}", (*a).cols, (*b).rows),
        );
        return ptr::null_mut();
    }
    let (lhs, rhs) = (cells(a), cells(b));
    let (inner, bcols) = ((*a).cols, (*b).cols);
    build((*a).rows, bcols, |r, c| {
        (0..inner)
            .map(|k| lhs[(r * inner + k) as usize] * rhs[(k * bcols + c) as usize])
            .sum()
    })
}

/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_sum(m: *const Matrix) -> f64 {
    if m.is_null() {
        return 0.0;
    }
    cells(m).iter().sum()
}

/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_mean(m: *const Matrix) -> f64 {
    if m.is_null() {
        return 0.0;
    }
    let n = cells(m).len();
    if n == 0 {
        return 0.0;
    }
    cells(m).iter().sum::<f64>() / n as f64
}

/// Same cells, new shape. The element count must be preserved.
///
/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_reshape(m: *const Matrix, rows: i64, cols: i64) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    if rows * cols != (*m).rows * (*m).cols {
        diagnostic(
            "matrix_reshape",
            &format!(
                "cannot reshape {}x{} into {}x{}",
                (*m).rows,
                (*m).cols,
                rows,
                cols
            ),
        );
        return ptr::null_mut();
    }
    let src = cells(m);
    build(rows, cols, |r, c| src[(r * cols + c) as usize])
}

/// Rows `[start, end)`, clamped to the valid range.
///
/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_slice(m: *const Matrix, start: i64, end: i64) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    let start = start.clamp(0, (*m).rows);
    let end = end.clamp(start, (*m).rows);
    if start == end {
        diagnostic("matrix_slice", "empty row range");
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols;
    build(end - start, cols, |r, c| {
        src[((start + r) * cols + c) as usize]
    })
}

/// Horizontal stack; both operands need the same row count.
///
/// # Safety
/// Both arguments must be null or valid matrices.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_concat(a: *const Matrix, b: *const Matrix) -> *mut Matrix {
    if a.is_null() || b.is_null() {
        return ptr::null_mut();
    }
    if (*a).rows != (*b).rows {
        diagnostic(
            "matrix_concat",
            &format!("row counts {} vs {}", (*a).rows, (*b).rows),
        );
        return ptr::null_mut();
    }
    let (lhs, rhs) = (cells(a), cells(b));
    let (lcols, rcols) = ((*a).cols, (*b).cols);
    build((*a).rows, lcols + rcols, |r, c| {
        if c < lcols {
            lhs[(r * lcols + c) as usize]
        } else {
            rhs[(r * rcols + (c - lcols)) as usize]
        }
    })
}

/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_relu(m: *const Matrix) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols;
    build((*m).rows, cols, |r, c| src[(r * cols + c) as usize].max(0.0))
}

// tanh approximation of the Gaussian error linear unit.
fn gelu_scalar(x: f64) -> f64 {
    let inner = (2.0 / std::f64::consts::PI).sqrt() * (x + 0.044715 * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_gelu(m: *const Matrix) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols;
    build((*m).rows, cols, |r, c| gelu_scalar(src[(r * cols + c) as usize]))
}

/// Row-wise softmax with the max shifted out for stability.
///
/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_softmax(m: *const Matrix) -> *mut Matrix {
    if m.is_null() {
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols as usize;
    let out = alloc_matrix((*m).rows, (*m).cols);
    if out.is_null() {
        return out;
    }
    let dst = cells_mut(out);
    for r in 0..(*m).rows as usize {
        let row = &src[r * cols..(r + 1) * cols];
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0;
        for (c, &x) in row.iter().enumerate() {
            let e = (x - max).exp();
            dst[r * cols + c] = e;
            total += e;
        }
        for c in 0..cols {
            dst[r * cols + c] /= total;
        }
    }
    out
}

/// Row-wise layer normalization.
///
/// # Safety
/// `m` must be null or a valid matrix.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_layer_norm(m: *const Matrix) -> *mut Matrix {
    const NORM_EPSILON: f64 = 1e-5;
    if m.is_null() {
        return ptr::null_mut();
    }
    let src = cells(m);
    let cols = (*m).cols as usize;
    let out = alloc_matrix((*m).rows, (*m).cols);
    if out.is_null() {
        return out;
    }
    let dst = cells_mut(out);
    for r in 0..(*m).rows as usize {
        let row = &src[r * cols..(r + 1) * cols];
        let mean = row.iter().sum::<f64>() / cols as f64;
        let variance = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / cols as f64;
        let denom = (variance + NORM_EPSILON).sqrt();
        for (c, &x) in row.iter().enumerate() {
            dst[r * cols + c] = (x - mean) / denom;
        }
    }
    out
}

/// Gather rows of `table` by the ids in `ids`. Out-of-range ids
/// select a zero row.
///
/// # Safety
/// Arguments must be null or valid handles of their kinds.
#[no_mangle]
pub unsafe extern "C" fn eigen_matrix_embedding_lookup(
    table: *const Matrix,
    ids: *const List,
) -> *mut Matrix {
    if table.is_null() || ids.is_null() {
        return ptr::null_mut();
    }
    let src = cells(table);
    let cols = (*table).cols;
    let count = (*ids).length;
    build(count, cols, |r, c| {
        let id = *(*ids).data.offset(r as isize);
        let row = id as i64;
        if row < 0 || row >= (*table).rows {
            0.0
        } else {
            src[(row * cols + c) as usize]
        }
    })
}

/// Sinusoidal positional encodings: sin on even columns, cos on odd,
/// wavelengths geometric in 10000^(2i/dim).
#[no_mangle]
pub extern "C" fn eigen_matrix_sinusoidal_pe(positions: i64, dim: i64) -> *mut Matrix {
    build(positions, dim, |pos, c| {
        let pair = (c / 2) as f64;
        let angle = pos as f64 / 10000f64.powf(2.0 * pair / dim as f64);
        if c % 2 == 0 { angle.sin() } else { angle.cos() }
    })
}

/// Causal attention mask: zero on and below the diagonal, -1e9 above.
#[no_mangle]
pub extern "C" fn eigen_matrix_causal_mask(n: i64) -> *mut Matrix {
    build(n, n, |r, c| if c > r { -1e9 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn from_rows(rows: &[&[f64]]) -> *mut Matrix {
        let m = alloc_matrix(rows.len() as i64, rows[0].len() as i64);
        let dst = unsafe { cells_mut(m) };
        for (r, row) in rows.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                dst[r * row.len() + c] = v;
            }
        }
        m
    }

    fn to_rows(m: *const Matrix) -> Vec<Vec<f64>> {
        let src = unsafe { cells(m) };
        let cols = unsafe { (*m).cols } as usize;
        src.chunks(cols).map(<[f64]>::to_vec).collect()
    }

    #[test]
    fn transpose_is_involutive() {
        let m = from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        unsafe {
            let t = eigen_matrix_transpose(m);
            let back = eigen_matrix_transpose(t);
            assert_eq!(to_rows(back), to_rows(m));
            assert_eq!(to_rows(t), vec![vec![1.0, 4.0], vec![2.0, 5.0], vec![3.0, 6.0]]);
            for p in [m, t, back] {
                eigen_matrix_destroy(p);
            }
        }
    }

    #[test]
    fn matmul_checks_inner_dimension() {
        let a = from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let b = from_rows(&[&[5.0], &[6.0]]);
        let bad = from_rows(&[&[1.0, 2.0, 3.0]]);
        unsafe {
            let product = eigen_matrix_matmul(a, b);
            assert_eq!(to_rows(product), vec![vec![17.0], vec![39.0]]);
            assert!(eigen_matrix_matmul(a, bad).is_null());
            for p in [a, b, bad, product] {
                eigen_matrix_destroy(p);
            }
        }
    }

    #[test]
    fn add_requires_equal_shapes() {
        let a = from_rows(&[&[1.0, 2.0]]);
        let b = from_rows(&[&[10.0, 20.0]]);
        let tall = from_rows(&[&[1.0], &[2.0]]);
        unsafe {
            let total = eigen_matrix_add(a, b);
            assert_eq!(to_rows(total), vec![vec![11.0, 22.0]]);
            assert!(eigen_matrix_add(a, tall).is_null());
            for p in [a, b, tall, total] {
                eigen_matrix_destroy(p);
            }
        }
    }

    #[test]
    fn identity_multiplication_is_neutral() {
        let m = from_rows(&[&[3.0, 1.0], &[2.0, 7.0]]);
        unsafe {
            let id = eigen_matrix_identity(2);
            let product = eigen_matrix_matmul(m, id);
            assert_eq!(to_rows(product), to_rows(m));
            for p in [m, id, product] {
                eigen_matrix_destroy(p);
            }
        }
    }

    #[test]
    fn random_stream_is_deterministic_per_seed() {
        eigen_matrix_seed(99);
        let a = eigen_matrix_random(2, 2);
        eigen_matrix_seed(99);
        let b = eigen_matrix_random(2, 2);
        unsafe {
            assert_eq!(to_rows(a), to_rows(b));
            for v in cells(a) {
                assert!((0.0..1.0).contains(v));
            }
            eigen_matrix_destroy(a);
            eigen_matrix_destroy(b);
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let m = from_rows(&[&[1.0, 2.0, 3.0], &[1000.0, 1000.0, 1000.0]]);
        unsafe {
            let s = eigen_matrix_softmax(m);
            for row in to_rows(s) {
                let total: f64 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-12);
            }
            // The shifted row does not overflow into NaN.
            assert!(to_rows(s)[1].iter().all(|v| (v - 1.0 / 3.0).abs() < 1e-12));
            eigen_matrix_destroy(m);
            eigen_matrix_destroy(s);
        }
    }

    #[test]
    fn layer_norm_centers_rows() {
        let m = from_rows(&[&[2.0, 4.0, 6.0]]);
        unsafe {
            let n = eigen_matrix_layer_norm(m);
            let row = &to_rows(n)[0];
            let mean: f64 = row.iter().sum::<f64>() / 3.0;
            assert!(mean.abs() < 1e-9);
            eigen_matrix_destroy(m);
            eigen_matrix_destroy(n);
        }
    }

    #[test]
    fn causal_mask_blocks_future_positions() {
        let m = eigen_matrix_causal_mask(3);
        let rows = to_rows(m);
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][2], -1e9);
        assert_eq!(rows[2][0], 0.0);
        unsafe { eigen_matrix_destroy(m) };
    }

    #[test]
    fn shape_and_slice_and_concat() {
        let m = from_rows(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]);
        unsafe {
            let shape = eigen_matrix_shape(m);
            assert_eq!(crate::list::eigen_list_get(shape, 0), 3.0);
            assert_eq!(crate::list::eigen_list_get(shape, 1), 2.0);
            crate::list::eigen_list_destroy(shape);

            let mid = eigen_matrix_slice(m, 1, 2);
            assert_eq!(to_rows(mid), vec![vec![3.0, 4.0]]);

            let wide = eigen_matrix_concat(mid, mid);
            assert_eq!(to_rows(wide), vec![vec![3.0, 4.0, 3.0, 4.0]]);

            for p in [m, mid, wide] {
                eigen_matrix_destroy(p);
            }
        }
    }

    #[test]
    fn reshape_preserves_cell_order() {
        let m = from_rows(&[&[1.0, 2.0, 3.0, 4.0]]);
        unsafe {
            let square = eigen_matrix_reshape(m, 2, 2);
            assert_eq!(to_rows(square), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
            assert!(eigen_matrix_reshape(m, 3, 2).is_null());
            eigen_matrix_destroy(m);
            eigen_matrix_destroy(square);
        }
    }

    #[test]
    fn embedding_lookup_gathers_rows() {
        let table = from_rows(&[&[0.0, 0.1], &[1.0, 1.1], &[2.0, 2.1]]);
        let ids = crate::list::eigen_list_create(2);
        unsafe {
            crate::list::eigen_list_set(ids, 0, 2.0);
            crate::list::eigen_list_set(ids, 1, 0.0);
            let picked = eigen_matrix_embedding_lookup(table, ids);
            assert_eq!(to_rows(picked), vec![vec![2.0, 2.1], vec![0.0, 0.1]]);
            eigen_matrix_destroy(table);
            eigen_matrix_destroy(picked);
            crate::list::eigen_list_destroy(ids);
        }
    }
}
