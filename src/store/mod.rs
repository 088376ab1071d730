//! Persistence contract for candidates, jobs, and publications.
//!
//! The candidate-reservation half is the system's one piece of real mutual
//! exclusion: `reserve_next` must be a single atomic conditional update, and
//! two concurrent callers against the same pool must never receive the same
//! candidate. The trait returns a plain `Option`, an updated row or
//! nothing, so callers never probe multiple result shapes.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CandidateStatus, ContentCandidate, GenerationJob, ScheduledPublication, SortOrder,
};
use crate::resources::TrimWindow;

#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

/// Insert payload for a new planned publication.
#[derive(Debug, Clone)]
pub struct NewPublication {
    pub owner: String,
    pub artifact_url: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub channel: String,
    pub privacy: String,
    pub scheduled_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically claim the next matching pending candidate: the
    /// `pending -> reserved` transition happens inside this single call.
    /// `None` means the pool is empty, an expected outcome, not an error.
    async fn reserve_next(
        &self,
        language: &str,
        sources: &[String],
        order: SortOrder,
    ) -> Result<Option<ContentCandidate>, StoreError>;

    async fn get_candidate(&self, id: i64) -> Result<Option<ContentCandidate>, StoreError>;

    /// Explicit status transition (operator reset, used/rejected marks).
    /// Returns false when no row matched.
    async fn mark_candidate(&self, id: i64, status: CandidateStatus) -> Result<bool, StoreError>;

    /// Remaining pool depth for monitoring/backpressure.
    async fn count_candidates(&self, language: &str, sources: &[String])
    -> Result<i64, StoreError>;

    async fn insert_job(&self, pool: &str, candidate_id: i64) -> Result<i64, StoreError>;

    async fn set_job_resources(
        &self,
        id: i64,
        background_url: Option<&str>,
        audio: Option<(&str, TrimWindow)>,
        gif_url: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn complete_job(
        &self,
        id: i64,
        artifact_url: &str,
        publication_id: i64,
    ) -> Result<(), StoreError>;

    async fn fail_job(&self, id: i64, error: &str) -> Result<(), StoreError>;

    async fn bump_job_retry(&self, id: i64) -> Result<(), StoreError>;

    async fn get_job(&self, id: i64) -> Result<Option<GenerationJob>, StoreError>;

    async fn insert_publication(&self, publication: &NewPublication) -> Result<i64, StoreError>;

    /// Scheduled times of all non-failed publications for `owner` within
    /// the window; feeds both slot-collision checks and the daily cap.
    async fn planned_between(
        &self,
        owner: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    /// Atomically move due `planned` rows to `publishing` and return them;
    /// overlapping publish ticks cannot double-claim.
    async fn claim_due_publications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledPublication>, StoreError>;

    async fn finish_publication(
        &self,
        id: i64,
        published_id: &str,
        published_url: &str,
    ) -> Result<(), StoreError>;

    async fn fail_publication(&self, id: i64, error: &str) -> Result<(), StoreError>;
}
