// ── Confirmation predicates ──
//
// A predicate decides whether an observed status shows that a command
// took effect. Predicates are pure and synchronous.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use fansync_api::Status;

use crate::device::value_int;

/// Pure check of a status snapshot.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Status) -> bool + Send + Sync>);

impl Predicate {
    pub fn new(check: impl Fn(&Status) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    /// True when every field of `expected` is present in the status with
    /// an equal value. Numbers compare by integer value, so `"1"`, `1`
    /// and `1.0` all match.
    pub fn fields_equal(expected: Status) -> Self {
        Self::new(move |status| {
            expected
                .iter()
                .all(|(key, want)| status.get(key).is_some_and(|got| values_match(got, want)))
        })
    }

    /// Evaluate against `status`. A panicking predicate counts as
    /// satisfied so the overlay falls back to showing the real state.
    pub fn check(&self, status: &Status) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(status))) {
            Ok(result) => result,
            Err(_) => {
                warn!("confirmation predicate panicked; releasing overlay");
                true
            }
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Field equality as the relay means it.
pub fn values_match(got: &Value, want: &Value) -> bool {
    match (value_int(got), value_int(want)) {
        (Some(a), Some(b)) => a == b,
        _ => got == want,
    }
}
