// The tracked scalar: a number that remembers how it got here.
//
// Every update records the previous value, the first difference
// (gradient), and a smoothness score derived from the second
// difference. A bounded ring of recent values backs the convergence
// predicates. The layout is #[repr(C)] because compiled programs
// address the record directly, both on the heap (create/destroy) and
// in stack slots the emitted IR allocates itself (init).

use std::alloc::{alloc, dealloc, Layout};

// Ring capacity. Entries beyond `history_size` are never read, which
// is what lets `init` skip clearing the array.
pub const HISTORY_LEN: usize = 100;

// Convergence threshold for per-variable predicates.
const EPSILON: f64 = 1e-6;

// A magnitude past this point is treated as divergence outright.
const DIVERGENCE_LIMIT: f64 = 1e10;

// Gradient growth factor that counts as "growing".
const GROWTH_FACTOR: f64 = 1.2;

// Sign changes among recent gradients needed to call it oscillation.
const MIN_SIGN_FLIPS: usize = 3;

#[repr(C)]
pub struct Tracked {
    pub value: f64,
    pub gradient: f64,
    pub stability: f64,
    pub iteration: i64,
    pub prev_value: f64,
    pub prev_gradient: f64,
    pub history: [f64; HISTORY_LEN],
    pub history_size: i32,
    pub history_index: i32,
}

impl Tracked {
    // Ring entry `back` steps behind the newest one. Entry 0 is the
    // current value. Only the first `history_size` entries are valid.
    fn entry(&self, back: usize) -> f64 {
        debug_assert!((back as i32) < self.history_size);
        let len = HISTORY_LEN as i64;
        let idx = (self.history_index as i64 - back as i64).rem_euclid(len);
        self.history[idx as usize]
    }

    // First difference `back` steps behind the newest one.
    fn delta(&self, back: usize) -> f64 {
        self.entry(back) - self.entry(back + 1)
    }

    // Number of valid consecutive deltas, capped at `limit`.
    fn delta_count(&self, limit: usize) -> usize {
        (self.history_size.max(1) as usize - 1).min(limit)
    }

    pub fn converged(&self) -> bool {
        if self.history_size < 5 {
            return false;
        }
        (0..self.delta_count(5)).all(|j| self.delta(j).abs() < EPSILON)
    }

    pub fn diverging(&self) -> bool {
        if self.history_size < 3 {
            return false;
        }
        if self.value.abs() > DIVERGENCE_LIMIT {
            return true;
        }
        if self.history_size < 4 {
            return false;
        }
        let oldest = self.delta(2).abs();
        let mid = self.delta(1).abs();
        let newest = self.delta(0).abs();
        mid >= GROWTH_FACTOR * oldest && newest >= GROWTH_FACTOR * mid
    }

    pub fn oscillating(&self) -> bool {
        if self.history_size < 6 {
            return false;
        }
        let n = self.delta_count(10);
        let flips = (0..n.saturating_sub(1))
            .filter(|&j| self.delta(j) * self.delta(j + 1) < 0.0)
            .count();
        flips >= MIN_SIGN_FLIPS
    }

    pub fn stable(&self) -> bool {
        self.stability > 0.8
    }

    pub fn improving(&self) -> bool {
        self.history_size >= 3 && self.gradient.abs() < self.prev_gradient.abs()
    }
}

// Write the initial field values into `slot` without touching the
// bulk of the history array. The ring is lazily initialized: only
// history[0] is meaningful until updates reach the rest, so init is
// O(1) rather than O(HISTORY_LEN). The emitted IR marks this symbol
// alwaysinline.
///
/// # Safety
/// `slot` must point to memory valid for a whole `Tracked` record.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_init(slot: *mut Tracked, value: f64) {
    if slot.is_null() {
        return;
    }
    (*slot).value = value;
    (*slot).gradient = 0.0;
    (*slot).stability = 1.0;
    (*slot).iteration = 0;
    (*slot).prev_value = value;
    (*slot).prev_gradient = 0.0;
    (*slot).history[0] = value;
    (*slot).history_size = 1;
    (*slot).history_index = 0;
}

/// Heap-allocate a tracked scalar. The caller owns the pointer.
/// Returns null when the allocator fails.
#[no_mangle]
pub extern "C" fn eigen_tracked_create(value: f64) -> *mut Tracked {
    let raw = unsafe { alloc(Layout::new::<Tracked>()) } as *mut Tracked;
    if raw.is_null() {
        return std::ptr::null_mut();
    }
    unsafe { eigen_tracked_init(raw, value) };
    raw
}

/// Record a new reading: recompute gradient, acceleration-derived
/// stability, rotate the ring, and shift the previous readings down.
///
/// # Safety
/// `t` must be null or a pointer obtained from create/init.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_update(t: *mut Tracked, value: f64) {
    if t.is_null() {
        return;
    }
    let gradient = value - (*t).value;
    let acceleration = gradient - (*t).gradient;
    let stability = (-acceleration.abs()).exp();

    let idx = ((*t).history_index + 1) % HISTORY_LEN as i32;
    (*t).history[idx as usize] = value;
    (*t).history_index = idx;
    if (*t).history_size < HISTORY_LEN as i32 {
        (*t).history_size += 1;
    }

    (*t).prev_gradient = (*t).gradient;
    (*t).prev_value = (*t).value;
    (*t).gradient = gradient;
    (*t).stability = stability;
    (*t).value = value;
    (*t).iteration += 1;
}

/// # Safety
/// `t` must be null or a pointer obtained from `eigen_tracked_create`.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_destroy(t: *mut Tracked) {
    if t.is_null() {
        return;
    }
    dealloc(t as *mut u8, Layout::new::<Tracked>());
}

// Accessors tolerate null by returning the neutral reading, so a
// failed allocation upstream degrades instead of faulting.

/// # Safety
/// `t` must be null or a valid tracked scalar.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_value(t: *const Tracked) -> f64 {
    if t.is_null() { 0.0 } else { (*t).value }
}

/// # Safety
/// `t` must be null or a valid tracked scalar.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_gradient(t: *const Tracked) -> f64 {
    if t.is_null() { 0.0 } else { (*t).gradient }
}

/// # Safety
/// `t` must be null or a valid tracked scalar.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_stability(t: *const Tracked) -> f64 {
    if t.is_null() { 1.0 } else { (*t).stability }
}

/// # Safety
/// `t` must be null or a valid tracked scalar.
#[no_mangle]
pub unsafe extern "C" fn eigen_tracked_iteration(t: *const Tracked) -> i64 {
    if t.is_null() { 0 } else { (*t).iteration }
}

// Predicate entry points, one per member of the convergence family.
// All return 1.0/0.0 doubles so the emitted IR can compose them with
// ordinary arithmetic.
macro_rules! predicate {
    ($($export:ident => $method:ident),+ $(,)?) => {$(
        /// # Safety
        /// `t` must be null or a valid tracked scalar.
        #[no_mangle]
        pub unsafe extern "C" fn $export(t: *const Tracked) -> f64 {
            if t.is_null() {
                return 0.0;
            }
            if (*t).$method() { 1.0 } else { 0.0 }
        }
    )+}
}

predicate! {
    eigen_check_converged => converged,
    eigen_check_diverging => diverging,
    eigen_check_oscillating => oscillating,
    eigen_check_stable => stable,
    eigen_check_improving => improving,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Drive a boxed tracked scalar through a sequence of updates.
    fn run(initial: f64, updates: &[f64]) -> Box<Tracked> {
        let raw = eigen_tracked_create(initial);
        assert!(!raw.is_null());
        for &v in updates {
            unsafe { eigen_tracked_update(raw, v) };
        }
        unsafe { Box::from_raw(raw) }
    }

    #[test]
    fn creation_state() {
        let t = run(42.0, &[]);
        assert_eq!(t.value, 42.0);
        assert_eq!(t.gradient, 0.0);
        assert_eq!(t.stability, 1.0);
        assert_eq!(t.iteration, 0);
        assert_eq!(t.history_size, 1);
        assert_eq!(t.history[0], 42.0);
    }

    #[test]
    fn update_sequence_invariant() {
        // After the k-th update: value = v_k, gradient = v_k - v_{k-1},
        // history_size = min(k + 1, HISTORY_LEN).
        let seq = [1.0, 4.0, 9.0, 16.0, 25.0];
        let raw = eigen_tracked_create(0.0);
        for (k, &v) in seq.iter().enumerate() {
            let prev = unsafe { eigen_tracked_value(raw) };
            unsafe { eigen_tracked_update(raw, v) };
            unsafe {
                assert_eq!(eigen_tracked_value(raw), v);
                assert_eq!(eigen_tracked_gradient(raw), v - prev);
                assert_eq!(eigen_tracked_iteration(raw), k as i64 + 1);
                assert_eq!((*raw).history_size, k as i32 + 2);
            }
        }
        unsafe { eigen_tracked_destroy(raw) };
    }

    #[test]
    fn stability_stays_in_unit_interval() {
        let t = run(0.0, &[1.0, -50.0, 1e6, 3.0, 3.0, 3.0]);
        assert!(t.stability > 0.0 && t.stability <= 1.0);
    }

    #[test]
    fn converged_on_tight_tail() {
        // Five values whose consecutive deltas are all below epsilon.
        let t = run(10.0, &[10.0 + 1e-8, 10.0 + 2e-8, 10.0 + 3e-8, 10.0 + 4e-8]);
        assert_eq!(t.history_size, 5);
        assert!(t.converged());

        // One loud delta in the window breaks it.
        let t = run(10.0, &[10.5, 10.5 + 1e-8, 10.5 + 2e-8, 10.5 + 3e-8]);
        assert!(!t.converged());
    }

    #[test]
    fn converged_needs_five_entries() {
        let t = run(1.0, &[1.0, 1.0]);
        assert!(!t.converged());
    }

    #[test]
    fn diverging_on_magnitude() {
        let t = run(1.0, &[2.0, 1e11]);
        assert!(t.diverging());
    }

    #[test]
    fn diverging_on_gradient_growth() {
        // Deltas 1.0, 1.5, 2.5: each at least 20% over the last.
        let t = run(0.0, &[1.0, 2.5, 5.0]);
        assert!(t.diverging());

        // Shrinking deltas are not divergence.
        let t = run(0.0, &[4.0, 6.0, 7.0]);
        assert!(!t.diverging());
    }

    #[test]
    fn oscillating_on_alternation() {
        let t = run(1.0, &[0.0, 1.0, 0.0, 1.0, 0.0]);
        assert!(t.oscillating());

        // Monotone descent never oscillates.
        let t = run(6.0, &[5.0, 4.0, 3.0, 2.0, 1.0]);
        assert!(!t.oscillating());
    }

    #[test]
    fn improving_when_gradient_shrinks() {
        let t = run(0.0, &[8.0, 12.0]);
        assert!(t.improving());
        let t = run(0.0, &[1.0, 9.0]);
        assert!(!t.improving());
    }

    #[test]
    fn ring_wraps_past_capacity() {
        // 101st update lands back at slot 0 and size saturates.
        let updates: Vec<f64> = (1..=101).map(f64::from).collect();
        let t = run(0.0, &updates);
        assert_eq!(t.history_size, HISTORY_LEN as i32);
        assert_eq!(t.history_index, 1);
        assert_eq!(t.entry(0), 101.0);
        assert_eq!(t.entry(99), 2.0);
        assert_eq!(t.value, 101.0);
        assert_eq!(t.gradient, 1.0);
    }

    #[test]
    fn null_tolerance() {
        unsafe {
            eigen_tracked_update(std::ptr::null_mut(), 1.0);
            assert_eq!(eigen_tracked_value(std::ptr::null()), 0.0);
            assert_eq!(eigen_tracked_stability(std::ptr::null()), 1.0);
            assert_eq!(eigen_check_converged(std::ptr::null()), 0.0);
        }
    }
}
