//! Dual-gate emission filter.
//!
//! A field passes only when both gates open: enough wall-clock since its
//! last emission (throttle) and enough movement since its last emitted
//! value (delta). Granularity 0 degrades the delta gate to "any change".
//! The first observation of an enabled field always passes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use vehicle_types::{haversine_m, Field, FieldFilterSpec, FieldValue};

pub struct DualGateFilter {
    specs: HashMap<Field, FieldFilterSpec>,
    state: Mutex<HashMap<Field, (FieldValue, Instant)>>,
}

impl DualGateFilter {
    pub fn new(specs: HashMap<Field, FieldFilterSpec>) -> Self {
        Self { specs, state: Mutex::new(HashMap::new()) }
    }

    /// Decide whether to emit `value` for `field` at `now`, recording the
    /// emission when the answer is yes.
    pub fn should_emit(&self, field: Field, value: &FieldValue, now: Instant) -> bool {
        let Some(spec) = self.specs.get(&field) else {
            return false;
        };
        if !spec.enabled {
            return false;
        }

        let mut state = self.state.lock().expect("filter state lock");
        let pass = match state.get(&field) {
            None => true,
            Some((last_value, last_at)) => {
                if now.duration_since(*last_at) < spec.throttle {
                    false
                } else {
                    let d = delta(value, last_value);
                    if spec.granularity == 0.0 { d > 0.0 } else { d >= spec.granularity }
                }
            }
        };
        if pass {
            state.insert(field, (value.clone(), now));
        }
        pass
    }
}

/// Movement between two values: haversine meters for locations, absolute
/// difference for numerics, 1/0 for everything else.
fn delta(value: &FieldValue, last: &FieldValue) -> f64 {
    match (value, last) {
        (FieldValue::Location(a), FieldValue::Location(b)) => {
            haversine_m(a.latlon(), b.latlon())
        }
        _ => match (value.as_f64(), last.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs(),
            _ => {
                if value != last {
                    1.0
                } else {
                    0.0
                }
            }
        },
    }
}
