//! Job progress arithmetic and the failed-chunk discard threshold.
//!
//! Pure functions shared by the coordinator and both store backends.

use crate::error::CoreError;

/// Highest percentage reported while a job is still active. `100` is
/// reserved for jobs whose results have actually been reassembled.
pub const MAX_ACTIVE_PERCENT: i16 = 99;

/// Percentage reported for a completed job.
pub const COMPLETED_PERCENT: i16 = 100;

/// Default fraction of failed chunks above which a job is aborted.
pub const DEFAULT_DISCARD_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// Step labels
// ---------------------------------------------------------------------------

pub const STEP_QUEUED: &str = "Queued";
pub const STEP_PROCESSING: &str = "Processing chunks";
pub const STEP_REASSEMBLING: &str = "Reassembling results";
pub const STEP_COMPLETED: &str = "Completed";
pub const STEP_FAILED: &str = "Failed";
pub const STEP_CANCELLING: &str = "Cancelling";
pub const STEP_CANCELLED: &str = "Cancelled";

/// Label for an active job that has finished `processed` of `total` chunks.
pub fn processed_step(processed: i32, total: i32) -> String {
    format!("Processed {processed} of {total} chunks")
}

/// Progress of an active job: `floor(100 * processed / total)` clamped to
/// `[0, MAX_ACTIVE_PERCENT]`.
///
/// A job with zero chunks reports zero.
pub fn active_percent(processed: i32, total: i32) -> i16 {
    if total <= 0 {
        return 0;
    }
    let processed = processed.clamp(0, total) as i64;
    let pct = (100 * processed) / total as i64;
    (pct as i16).clamp(0, MAX_ACTIVE_PERCENT)
}

/// Fraction of chunks that failed, in `0.0..=1.0`.
pub fn failure_fraction(failed: i32, total: i32) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (failed.max(0) as f64 / total as f64).min(1.0)
}

/// Whether the failed-chunk count has crossed the discard threshold.
///
/// The threshold is exclusive: a job with exactly `threshold` of its chunks
/// failed keeps running.
pub fn exceeds_discard_threshold(failed: i32, total: i32, threshold: f64) -> bool {
    failed > 0 && failure_fraction(failed, total) > threshold
}

/// Validate that a discard threshold is within `[0.0, 1.0]`.
pub fn validate_discard_threshold(threshold: f64) -> Result<(), CoreError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(CoreError::Validation(format!(
            "discard_threshold must be within [0.0, 1.0], got {threshold}"
        )));
    }
    Ok(())
}
