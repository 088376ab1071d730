//! Shared data models used across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a content candidate.
///
/// `pending -> reserved -> {used | rejected | deleted}`. The
/// `reserved -> pending` transition exists as a manual operator reset only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Reserved,
    Used,
    Rejected,
    Deleted,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Reserved => "reserved",
            CandidateStatus::Used => "used",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Deleted => "deleted",
        }
    }

    /// Rows ingested before the status column existed have NULL status and
    /// count as pending.
    pub fn parse(s: Option<&str>) -> CandidateStatus {
        match s {
            Some("reserved") => CandidateStatus::Reserved,
            Some("used") => CandidateStatus::Used,
            Some("rejected") => CandidateStatus::Rejected,
            Some("deleted") => CandidateStatus::Deleted,
            _ => CandidateStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> JobStatus {
        match s {
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    Planned,
    Publishing,
    Published,
    Failed,
}

impl PublicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationStatus::Planned => "planned",
            PublicationStatus::Publishing => "publishing",
            PublicationStatus::Published => "published",
            PublicationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> PublicationStatus {
        match s {
            "publishing" => PublicationStatus::Publishing,
            "published" => PublicationStatus::Published,
            "failed" => PublicationStatus::Failed,
            _ => PublicationStatus::Planned,
        }
    }
}

/// Candidate selection order within a pool. Joke pools drain oldest-first,
/// news pools newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    OldestFirst,
    NewestFirst,
}

/// A reservable unit of source content.
#[derive(Debug, Clone, Serialize)]
pub struct ContentCandidate {
    pub id: i64,
    pub language: String,
    pub source: String,
    pub text: String,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub edited_text: Option<String>,
    pub edited_title: Option<String>,
    pub status: CandidateStatus,
    pub reserved_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContentCandidate {
    /// User-edited text wins over the raw scraped text.
    pub fn display_text(&self) -> &str {
        self.edited_text.as_deref().unwrap_or(&self.text)
    }

    pub fn display_title(&self) -> Option<&str> {
        self.edited_title.as_deref().or(self.title.as_deref())
    }
}

/// One attempt to turn a candidate into a video.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationJob {
    pub id: i64,
    pub pool: String,
    pub candidate_id: i64,
    pub status: JobStatus,
    pub background_url: Option<String>,
    pub audio_url: Option<String>,
    pub audio_start: Option<f64>,
    pub audio_end: Option<f64>,
    pub gif_url: Option<String>,
    pub artifact_url: Option<String>,
    pub publication_id: Option<i64>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A video queued for release.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledPublication {
    pub id: i64,
    pub owner: String,
    pub artifact_url: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub channel: String,
    pub privacy: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: PublicationStatus,
    pub published_id: Option<String>,
    pub published_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
