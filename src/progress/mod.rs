//! Progress signals and estimation.

pub mod estimate;
pub mod event;

pub use estimate::{
    estimated_time_remaining, overall_percent, EstimatorSettings, TimeRemaining,
    PARTIAL_CREDIT_CAP,
};
pub use event::{parse_wire_status, ProgressEvent};
