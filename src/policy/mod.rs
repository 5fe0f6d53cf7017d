//! Policy-window tracking.
//!
//! Every finding gets a filing deadline and an alert level from the
//! per-claim-type policy table. Deadlines are calendar or business days per
//! type; business-day math skips weekends and the US federal holiday set.

pub mod holidays;
pub mod windows;

pub use windows::{
    AlertLevel, ClaimType, ClaimWindowStatus, ExpiringClaims, FilingRecommendation, PolicyTracker,
    PolicyWindow,
};
