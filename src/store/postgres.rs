//! Postgres-backed store.
//!
//! Reservation and due-publication claims are single conditional updates
//! built on `FOR UPDATE SKIP LOCKED`, so concurrent workers contend in the
//! database, not in application code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{
    CandidateStatus, ContentCandidate, GenerationJob, JobStatus, PublicationStatus,
    ScheduledPublication, SortOrder,
};
use crate::resources::TrimWindow;
use crate::store::{NewPublication, Store, StoreError};

pub struct PgStore {
    pool: PgPool,
}

const CANDIDATE_COLUMNS: &str =
    "id, language, source, text, title, image_url, edited_text, edited_title, \
     status, reserved_at, used_at, created_at";

const JOB_COLUMNS: &str =
    "id, pool, candidate_id, status, background_url, audio_url, audio_start, audio_end, \
     gif_url, artifact_url, publication_id, error, retry_count, created_at, finished_at";

const PUBLICATION_COLUMNS: &str =
    "id, owner, artifact_url, title, description, tags, channel, privacy, scheduled_at, \
     status, published_id, published_url, error, created_at";

type CandidateRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
);

type JobRow = (
    i64,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    i32,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

type PublicationRow = (
    i64,
    String,
    String,
    String,
    String,
    Json<Vec<String>>,
    String,
    String,
    DateTime<Utc>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

fn candidate_from_row(row: CandidateRow) -> ContentCandidate {
    ContentCandidate {
        id: row.0,
        language: row.1,
        source: row.2,
        text: row.3,
        title: row.4,
        image_url: row.5,
        edited_text: row.6,
        edited_title: row.7,
        status: CandidateStatus::parse(row.8.as_deref()),
        reserved_at: row.9,
        used_at: row.10,
        created_at: row.11,
    }
}

fn job_from_row(row: JobRow) -> GenerationJob {
    GenerationJob {
        id: row.0,
        pool: row.1,
        candidate_id: row.2,
        status: JobStatus::parse(&row.3),
        background_url: row.4,
        audio_url: row.5,
        audio_start: row.6,
        audio_end: row.7,
        gif_url: row.8,
        artifact_url: row.9,
        publication_id: row.10,
        error: row.11,
        retry_count: row.12,
        created_at: row.13,
        finished_at: row.14,
    }
}

fn publication_from_row(row: PublicationRow) -> ScheduledPublication {
    ScheduledPublication {
        id: row.0,
        owner: row.1,
        artifact_url: row.2,
        title: row.3,
        description: row.4,
        tags: row.5.0,
        channel: row.6,
        privacy: row.7,
        scheduled_at: row.8,
        status: PublicationStatus::parse(&row.9),
        published_id: row.10,
        published_url: row.11,
        error: row.12,
        created_at: row.13,
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent schema setup, run once at startup.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_candidates (
                id BIGSERIAL PRIMARY KEY,
                language TEXT NOT NULL,
                source TEXT NOT NULL,
                text TEXT NOT NULL,
                title TEXT,
                image_url TEXT,
                edited_text TEXT,
                edited_title TEXT,
                status TEXT,
                reserved_at TIMESTAMPTZ,
                used_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candidates_pool
             ON content_candidates (language, source, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generation_jobs (
                id BIGSERIAL PRIMARY KEY,
                pool TEXT NOT NULL,
                candidate_id BIGINT NOT NULL,
                status TEXT NOT NULL DEFAULT 'processing',
                background_url TEXT,
                audio_url TEXT,
                audio_start DOUBLE PRECISION,
                audio_end DOUBLE PRECISION,
                gif_url TEXT,
                artifact_url TEXT,
                publication_id BIGINT,
                error TEXT,
                retry_count INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                finished_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_publications (
                id BIGSERIAL PRIMARY KEY,
                owner TEXT NOT NULL,
                artifact_url TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                tags JSONB NOT NULL DEFAULT '[]'::jsonb,
                channel TEXT NOT NULL,
                privacy TEXT NOT NULL DEFAULT 'public',
                scheduled_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL DEFAULT 'planned',
                published_id TEXT,
                published_url TEXT,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_publications_due
             ON scheduled_publications (status, scheduled_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn reserve_next(
        &self,
        language: &str,
        sources: &[String],
        order: SortOrder,
    ) -> Result<Option<ContentCandidate>, StoreError> {
        let direction = match order {
            SortOrder::OldestFirst => "ASC",
            SortOrder::NewestFirst => "DESC",
        };

        // One atomic conditional update: select-and-lock the next pending
        // row, flip it to reserved, return it. SKIP LOCKED keeps concurrent
        // reservers from ever seeing the same row.
        let query = format!(
            r#"
            WITH next AS (
                SELECT id FROM content_candidates
                WHERE (status = 'pending' OR status IS NULL)
                  AND language = $1
                  AND source = ANY($2)
                ORDER BY created_at {}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE content_candidates c
            SET status = 'reserved', reserved_at = NOW()
            FROM next
            WHERE c.id = next.id
            RETURNING {}
            "#,
            direction,
            prefixed(CANDIDATE_COLUMNS, "c."),
        );

        let row: Option<CandidateRow> = sqlx::query_as(&query)
            .bind(language)
            .bind(sources)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(candidate_from_row))
    }

    async fn get_candidate(&self, id: i64) -> Result<Option<ContentCandidate>, StoreError> {
        let query = format!(
            "SELECT {} FROM content_candidates WHERE id = $1",
            CANDIDATE_COLUMNS
        );
        let row: Option<CandidateRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(candidate_from_row))
    }

    async fn mark_candidate(&self, id: i64, status: CandidateStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE content_candidates
            SET status = $2,
                used_at = CASE WHEN $2 = 'used' THEN NOW() ELSE used_at END,
                reserved_at = CASE WHEN $2 = 'pending' THEN NULL ELSE reserved_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_candidates(
        &self,
        language: &str,
        sources: &[String],
    ) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM content_candidates
            WHERE (status = 'pending' OR status IS NULL)
              AND language = $1
              AND source = ANY($2)
            "#,
        )
        .bind(language)
        .bind(sources)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_job(&self, pool: &str, candidate_id: i64) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO generation_jobs (pool, candidate_id, status)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(pool)
        .bind(candidate_id)
        .bind(JobStatus::Processing.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn set_job_resources(
        &self,
        id: i64,
        background_url: Option<&str>,
        audio: Option<(&str, TrimWindow)>,
        gif_url: Option<&str>,
    ) -> Result<(), StoreError> {
        let (audio_url, audio_start, audio_end) = match audio {
            Some((url, trim)) => (Some(url), Some(trim.start), Some(trim.end)),
            None => (None, None, None),
        };
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET background_url = $2, audio_url = $3, audio_start = $4,
                audio_end = $5, gif_url = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(background_url)
        .bind(audio_url)
        .bind(audio_start)
        .bind(audio_end)
        .bind(gif_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        id: i64,
        artifact_url: &str,
        publication_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'completed', artifact_url = $2, publication_id = $3,
                error = NULL, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(artifact_url)
        .bind(publication_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'failed', error = $2, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_job_retry(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE generation_jobs
             SET retry_count = retry_count + 1, status = 'processing', finished_at = NULL
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<Option<GenerationJob>, StoreError> {
        let query = format!("SELECT {} FROM generation_jobs WHERE id = $1", JOB_COLUMNS);
        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(job_from_row))
    }

    async fn insert_publication(&self, publication: &NewPublication) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO scheduled_publications
                (owner, artifact_url, title, description, tags, channel, privacy,
                 scheduled_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&publication.owner)
        .bind(&publication.artifact_url)
        .bind(&publication.title)
        .bind(&publication.description)
        .bind(Json(&publication.tags))
        .bind(&publication.channel)
        .bind(&publication.privacy)
        .bind(publication.scheduled_at)
        .bind(PublicationStatus::Planned.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn planned_between(
        &self,
        owner: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT scheduled_at FROM scheduled_publications
            WHERE owner = $1 AND scheduled_at >= $2 AND scheduled_at <= $3
              AND status != 'failed'
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(owner)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn claim_due_publications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledPublication>, StoreError> {
        let query = format!(
            r#"
            WITH due AS (
                SELECT id FROM scheduled_publications
                WHERE status = 'planned' AND scheduled_at <= $1
                ORDER BY scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_publications p
            SET status = 'publishing'
            FROM due
            WHERE p.id = due.id
            RETURNING {}
            "#,
            prefixed(PUBLICATION_COLUMNS, "p."),
        );

        let rows: Vec<PublicationRow> = sqlx::query_as(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(publication_from_row).collect())
    }

    async fn finish_publication(
        &self,
        id: i64,
        published_id: &str,
        published_url: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scheduled_publications
            SET status = 'published', published_id = $2, published_url = $3, error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(published_id)
        .bind(published_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_publication(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scheduled_publications
            SET status = 'failed', error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Prefix every column in a comma-separated list (for RETURNING through a
/// joined UPDATE).
fn prefixed(columns: &str, prefix: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}{}", prefix, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
