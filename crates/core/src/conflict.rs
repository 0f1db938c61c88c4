//! Advisory overlap detection between invalidation jobs.
//!
//! Overlaps are reported, never enforced: operators routinely queue redundant
//! purges (retries, safety margins), so every match becomes a warning.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entity::Entity;
use crate::id::JobId;
use crate::job::{JobRecord, TtlHours};

/// A job about to be written, described by its purge window.
#[derive(Debug, Clone)]
pub struct CandidateWindow<'a> {
    pub asset_url: &'a str,
    pub start_time: DateTime<Utc>,
    pub ttl_hours: TtlHours,
    /// Job being replaced; it never conflicts with itself.
    pub replacing: Option<JobId>,
}

impl CandidateWindow<'_> {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time
            .checked_add_signed(self.ttl_hours.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// An existing job whose window and path overlap the candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConflict {
    pub job_id: JobId,
    pub asset_url: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub overlap_start: DateTime<Utc>,
    pub overlap_end: DateTime<Utc>,
}

impl core::fmt::Display for JobConflict {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Invalidation job {} for {} (start:{} end {}) overlaps this request between {} and {}",
            self.job_id,
            self.asset_url,
            self.start_time.to_rfc3339(),
            self.end_time.to_rfc3339(),
            self.overlap_start.to_rfc3339(),
            self.overlap_end.to_rfc3339(),
        )
    }
}

/// Whether one asset URL is a path prefix of the other, in either direction.
///
/// Case-sensitive. Trailing slashes are ignored and a prefix only counts when it
/// ends on a segment boundary, so `/path` covers `/path/sub` but not `/pathology`.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('/');
    let b = b.trim_end_matches('/');
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    match long.strip_prefix(short) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Scan `existing` (jobs of the same delivery service) for overlaps with `candidate`.
///
/// Windows are half-open: `[start, start + ttl)`.
pub fn find_conflicts(candidate: &CandidateWindow<'_>, existing: &[JobRecord]) -> Vec<JobConflict> {
    let start = candidate.start_time;
    let end = candidate.end_time();

    existing
        .iter()
        .filter(|job| Some(job.id()) != candidate.replacing)
        .filter(|job| job.start_time < end && start < job.end_time())
        .filter(|job| paths_overlap(&job.asset_url, candidate.asset_url))
        .map(|job| JobConflict {
            job_id: job.id,
            asset_url: job.asset_url.clone(),
            start_time: job.start_time,
            end_time: job.end_time(),
            overlap_start: start.max(job.start_time),
            overlap_end: end.min(job.end_time()),
        })
        .collect()
}
