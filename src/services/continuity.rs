//! Same-occupancy predicates
//!
//! Decide whether two apartment-days belong to one continuous stay. The
//! reconciler only asks the predicate; it never inspects day signals itself.

use chrono::NaiveDate;

/// What the predicate may look at for one apartment-day
#[derive(Debug, Clone, PartialEq)]
pub struct DaySignals {
    pub date: NaiveDate,
    pub guest: Option<String>,
    pub reference_code: Option<String>,
    pub rate: f64,
    pub color_hex: Option<String>,
}

/// Decides whether `current` continues the stay that includes `previous`
pub trait SameOccupancy: Send + Sync {
    fn same_occupancy(&self, previous: &DaySignals, current: &DaySignals) -> bool;

    /// Name for logs
    fn name(&self) -> &'static str;
}

fn differs(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => !a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    }
}

fn contiguous(previous: &DaySignals, current: &DaySignals) -> bool {
    previous.date.succ_opt() == Some(current.date)
}

/// Default predicate: contiguous days with no conflicting guest or reference.
///
/// Missing identity on either side never splits; rate and color are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestContinuity;

impl SameOccupancy for GuestContinuity {
    fn same_occupancy(&self, previous: &DaySignals, current: &DaySignals) -> bool {
        contiguous(previous, current)
            && !differs(previous.guest.as_deref(), current.guest.as_deref())
            && !differs(
                previous.reference_code.as_deref(),
                current.reference_code.as_deref(),
            )
    }

    fn name(&self) -> &'static str {
        "guest"
    }
}

/// Stricter predicate: like [`GuestContinuity`], also splits on a fill change
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorContinuity;

impl SameOccupancy for ColorContinuity {
    fn same_occupancy(&self, previous: &DaySignals, current: &DaySignals) -> bool {
        GuestContinuity.same_occupancy(previous, current)
            && !differs(previous.color_hex.as_deref(), current.color_hex.as_deref())
    }

    fn name(&self) -> &'static str {
        "color"
    }
}

/// Predicate by configuration name; unknown names fall back to the default
pub fn predicate_by_name(name: &str) -> Box<dyn SameOccupancy> {
    match name.trim().to_lowercase().as_str() {
        "color" | "colour" => Box::new(ColorContinuity),
        _ => Box::new(GuestContinuity),
    }
}
