// Process-wide fallback tracker. When a predicate is not bound to a
// particular variable, the compiler routes the most recent
// assignments through `track_value` and the unscoped predicates read
// the resulting stream of changes. One instance per process; the
// single-threaded execution model means the mutex is only ever
// uncontended.

use std::sync::Mutex;

// Ring capacity for recorded changes.
const CHANGE_LEN: usize = 100;

// Unscoped predicates use a coarser threshold than the per-variable
// family: the stream mixes whatever the program assigns.
const EPSILON: f64 = 1e-4;

// Equilibrium bound on the sum of recent changes.
const EQUILIBRIUM_BOUND: f64 = 1e-3;

pub struct ChangeTracker {
    last_value: f64,
    prev_value: f64,
    changes: [f64; CHANGE_LEN],
    index: i32,
    count: i32,
}

impl ChangeTracker {
    pub const fn new() -> ChangeTracker {
        ChangeTracker {
            last_value: 0.0,
            prev_value: 0.0,
            changes: [0.0; CHANGE_LEN],
            index: 0,
            count: 0,
        }
    }

    pub fn track(&mut self, value: f64) {
        let change = value - self.last_value;
        self.index = (self.index + 1) % CHANGE_LEN as i32;
        self.changes[self.index as usize] = change;
        if self.count < CHANGE_LEN as i32 {
            self.count += 1;
        }
        self.prev_value = self.last_value;
        self.last_value = value;
    }

    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    pub fn prev_value(&self) -> f64 {
        self.prev_value
    }

    // Change `back` steps behind the newest one.
    fn change(&self, back: usize) -> f64 {
        debug_assert!((back as i32) < self.count);
        let len = CHANGE_LEN as i64;
        let idx = (self.index as i64 - back as i64).rem_euclid(len);
        self.changes[idx as usize]
    }

    // The newest `limit` changes, newest first.
    fn recent(&self, limit: usize) -> impl Iterator<Item = f64> + '_ {
        (0..(self.count as usize).min(limit)).map(|j| self.change(j))
    }

    pub fn converged(&self) -> bool {
        self.count >= 3 && self.recent(3).all(|c| c.abs() < EPSILON)
    }

    // No mixed directions above the noise floor among recent changes.
    pub fn stable(&self) -> bool {
        if self.count < 5 {
            return false;
        }
        let rising = self.recent(5).any(|c| c > EPSILON);
        let falling = self.recent(5).any(|c| c < -EPSILON);
        !(rising && falling)
    }

    pub fn diverging(&self) -> bool {
        self.count >= 3
            && self.change(0).abs() > self.change(1).abs()
            && self.change(1).abs() > self.change(2).abs()
    }

    pub fn improving(&self) -> bool {
        self.count >= 2 && self.change(0).abs() < self.change(1).abs()
    }

    pub fn oscillating(&self) -> bool {
        let changes: Vec<f64> = self.recent(4).collect();
        let flips = changes
            .windows(2)
            .filter(|pair| pair[0] * pair[1] < 0.0)
            .count();
        flips >= 2
    }

    pub fn equilibrium(&self) -> bool {
        self.count >= 5 && self.recent(5).sum::<f64>().abs() < EQUILIBRIUM_BOUND
    }

    pub fn stuck(&self) -> bool {
        !self.converged() && !self.improving()
    }

    pub fn chaotic(&self) -> bool {
        if self.count < 5 {
            return false;
        }
        let mean = self.recent(5).sum::<f64>() / 5.0;
        let variance = self.recent(5).map(|c| (c - mean) * (c - mean)).sum::<f64>() / 5.0;
        variance > 10.0 * mean.abs()
    }

    // Settled and balanced are composites of the primitives above.
    pub fn settled(&self) -> bool {
        self.converged() && self.stable()
    }

    pub fn balanced(&self) -> bool {
        self.equilibrium() && !self.diverging()
    }

    // Direction of the last few changes: -1 falling, 1 rising,
    // 0 flat, 0.5 mixed.
    pub fn trend(&self) -> f64 {
        let changes: Vec<f64> = self.recent(3).collect();
        if changes.is_empty() {
            return 0.0;
        }
        if changes.iter().all(|c| c.abs() < EPSILON) {
            return 0.0;
        }
        if changes.iter().all(|&c| c > 0.0) {
            return 1.0;
        }
        if changes.iter().all(|&c| c < 0.0) {
            return -1.0;
        }
        0.5
    }
}

lazy_static! {
    static ref TRACKER: Mutex<ChangeTracker> = Mutex::new(ChangeTracker::new());
}

fn with_tracker<T>(f: impl FnOnce(&mut ChangeTracker) -> T) -> T {
    f(&mut TRACKER.lock().expect("tracker lock poisoned"))
}

/// Feed one value into the process-wide tracker.
#[no_mangle]
pub extern "C" fn eigen_track_value(value: f64) {
    with_tracker(|t| t.track(value));
}

/// Forget everything the process-wide tracker has seen.
#[no_mangle]
pub extern "C" fn eigen_tracker_reset() {
    with_tracker(|t| *t = ChangeTracker::new());
}

macro_rules! unscoped_predicate {
    ($($export:ident => $method:ident),+ $(,)?) => {$(
        #[no_mangle]
        pub extern "C" fn $export() -> f64 {
            if with_tracker(|t| t.$method()) { 1.0 } else { 0.0 }
        }
    )+}
}

unscoped_predicate! {
    eigen_is_converged => converged,
    eigen_is_stable => stable,
    eigen_is_diverging => diverging,
    eigen_is_improving => improving,
    eigen_is_oscillating => oscillating,
    eigen_is_equilibrium => equilibrium,
    eigen_is_stuck => stuck,
    eigen_is_chaotic => chaotic,
    eigen_is_settled => settled,
    eigen_is_balanced => balanced,
}

// Temporal operators over the same stream.

/// The value before the latest tracked one. The argument is the
/// conventional operand slot and is ignored.
#[no_mangle]
pub extern "C" fn eigen_was_is(_x: f64) -> f64 {
    with_tracker(|t| t.prev_value())
}

/// Difference between `x` and the previously tracked value.
#[no_mangle]
pub extern "C" fn eigen_change_is(x: f64) -> f64 {
    with_tracker(|t| x - t.prev_value())
}

/// Tri-valued trend reading; see `ChangeTracker::trend`.
#[no_mangle]
pub extern "C" fn eigen_trend_is(_x: f64) -> f64 {
    with_tracker(|t| t.trend())
}
