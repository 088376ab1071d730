//! In-memory store for tests: same contract as Postgres, no database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use crate::models::{
    CandidateStatus, ContentCandidate, GenerationJob, JobStatus, PublicationStatus,
    ScheduledPublication, SortOrder,
};
use crate::resources::TrimWindow;
use crate::store::{NewPublication, Store, StoreError};

#[derive(Default)]
struct Inner {
    candidates: Vec<ContentCandidate>,
    jobs: Vec<GenerationJob>,
    publications: Vec<ScheduledPublication>,
    next_candidate_id: i64,
    next_job_id: i64,
    next_publication_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_candidate(
        &self,
        language: &str,
        source: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_candidate_id += 1;
        let id = inner.next_candidate_id;
        inner.candidates.push(ContentCandidate {
            id,
            language: language.to_string(),
            source: source.to_string(),
            text: text.to_string(),
            title: None,
            image_url: None,
            edited_text: None,
            edited_title: None,
            status: CandidateStatus::Pending,
            reserved_at: None,
            used_at: None,
            created_at,
        });
        id
    }

    pub fn candidate(&self, id: i64) -> Option<ContentCandidate> {
        self.inner
            .lock()
            .unwrap()
            .candidates
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn job(&self, id: i64) -> Option<GenerationJob> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.inner.lock().unwrap().jobs.clone()
    }

    pub fn publications(&self) -> Vec<ScheduledPublication> {
        self.inner.lock().unwrap().publications.clone()
    }

    pub fn seed_publication(&self, owner: &str, scheduled_at: DateTime<Utc>) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_publication_id += 1;
        let id = inner.next_publication_id;
        inner.publications.push(ScheduledPublication {
            id,
            owner: owner.to_string(),
            artifact_url: "mem://artifact.mp4".to_string(),
            title: "seeded".to_string(),
            description: String::new(),
            tags: Vec::new(),
            channel: "chan".to_string(),
            privacy: "public".to_string(),
            scheduled_at,
            status: PublicationStatus::Planned,
            published_id: None,
            published_url: None,
            error: None,
            created_at: Utc::now(),
        });
        id
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn reserve_next(
        &self,
        language: &str,
        sources: &[String],
        order: SortOrder,
    ) -> Result<Option<ContentCandidate>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut eligible: Vec<usize> = inner
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.status == CandidateStatus::Pending
                    && c.language == language
                    && sources.contains(&c.source)
            })
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by_key(|&i| inner.candidates[i].created_at);
        if order == SortOrder::NewestFirst {
            eligible.reverse();
        }

        match eligible.first() {
            Some(&idx) => {
                let candidate = &mut inner.candidates[idx];
                candidate.status = CandidateStatus::Reserved;
                candidate.reserved_at = Some(Utc::now());
                Ok(Some(candidate.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_candidate(&self, id: i64) -> Result<Option<ContentCandidate>, StoreError> {
        Ok(self.candidate(id))
    }

    async fn mark_candidate(&self, id: i64, status: CandidateStatus) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.candidates.iter_mut().find(|c| c.id == id) {
            Some(candidate) => {
                candidate.status = status;
                if status == CandidateStatus::Used {
                    candidate.used_at = Some(Utc::now());
                }
                if status == CandidateStatus::Pending {
                    candidate.reserved_at = None;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_candidates(
        &self,
        language: &str,
        sources: &[String],
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .candidates
            .iter()
            .filter(|c| {
                c.status == CandidateStatus::Pending
                    && c.language == language
                    && sources.contains(&c.source)
            })
            .count() as i64)
    }

    async fn insert_job(&self, pool: &str, candidate_id: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_job_id += 1;
        let id = inner.next_job_id;
        inner.jobs.push(GenerationJob {
            id,
            pool: pool.to_string(),
            candidate_id,
            status: JobStatus::Processing,
            background_url: None,
            audio_url: None,
            audio_start: None,
            audio_end: None,
            gif_url: None,
            artifact_url: None,
            publication_id: None,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
            finished_at: None,
        });
        Ok(id)
    }

    async fn set_job_resources(
        &self,
        id: i64,
        background_url: Option<&str>,
        audio: Option<(&str, TrimWindow)>,
        gif_url: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.background_url = background_url.map(str::to_string);
            job.audio_url = audio.map(|(url, _)| url.to_string());
            job.audio_start = audio.map(|(_, trim)| trim.start);
            job.audio_end = audio.map(|(_, trim)| trim.end);
            job.gif_url = gif_url.map(str::to_string);
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: i64,
        artifact_url: &str,
        publication_id: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Completed;
            job.artifact_url = Some(artifact_url.to_string());
            job.publication_id = Some(publication_id);
            job.error = None;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_job(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn bump_job_retry(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.retry_count += 1;
            job.status = JobStatus::Processing;
            job.finished_at = None;
        }
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.job(id))
    }

    async fn insert_publication(&self, publication: &NewPublication) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_publication_id += 1;
        let id = inner.next_publication_id;
        inner.publications.push(ScheduledPublication {
            id,
            owner: publication.owner.clone(),
            artifact_url: publication.artifact_url.clone(),
            title: publication.title.clone(),
            description: publication.description.clone(),
            tags: publication.tags.clone(),
            channel: publication.channel.clone(),
            privacy: publication.privacy.clone(),
            scheduled_at: publication.scheduled_at,
            status: PublicationStatus::Planned,
            published_id: None,
            published_url: None,
            error: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn planned_between(
        &self,
        owner: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut times: Vec<DateTime<Utc>> = inner
            .publications
            .iter()
            .filter(|p| {
                p.owner == owner
                    && p.status != PublicationStatus::Failed
                    && p.scheduled_at >= from
                    && p.scheduled_at <= to
            })
            .map(|p| p.scheduled_at)
            .collect();
        times.sort();
        Ok(times)
    }

    async fn claim_due_publications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledPublication>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut claimed = Vec::new();
        for publication in inner.publications.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if publication.status == PublicationStatus::Planned && publication.scheduled_at <= now {
                publication.status = PublicationStatus::Publishing;
                claimed.push(publication.clone());
            }
        }
        Ok(claimed)
    }

    async fn finish_publication(
        &self,
        id: i64,
        published_id: &str,
        published_url: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(publication) = inner.publications.iter_mut().find(|p| p.id == id) {
            publication.status = PublicationStatus::Published;
            publication.published_id = Some(published_id.to_string());
            publication.published_url = Some(published_url.to_string());
        }
        Ok(())
    }

    async fn fail_publication(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(publication) = inner.publications.iter_mut().find(|p| p.id == id) {
            publication.status = PublicationStatus::Failed;
            publication.error = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_reservation_never_hands_out_a_candidate_twice() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for i in 0..5 {
            store.seed_candidate("en", "jokes", &format!("joke {}", i), now);
        }

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .reserve_next("en", &["jokes".to_string()], SortOrder::OldestFirst)
                    .await
                    .unwrap()
            });
        }

        let mut reserved_ids = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Some(candidate) = result.unwrap() {
                reserved_ids.push(candidate.id);
            }
        }

        reserved_ids.sort();
        let before_dedup = reserved_ids.len();
        reserved_ids.dedup();
        assert_eq!(before_dedup, reserved_ids.len(), "a candidate was double-claimed");
        assert_eq!(reserved_ids.len(), 5);
    }

    #[tokio::test]
    async fn reservation_order_respects_pool_sort() {
        let store = MemoryStore::new();
        let base = Utc::now();
        let old = store.seed_candidate("en", "news", "old", base - chrono::Duration::hours(2));
        let new = store.seed_candidate("en", "news", "new", base);

        let sources = vec!["news".to_string()];
        let first = store
            .reserve_next("en", &sources, SortOrder::NewestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, new);

        let second = store
            .reserve_next("en", &sources, SortOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, old);

        assert!(
            store
                .reserve_next("en", &sources, SortOrder::OldestFirst)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn empty_pool_reservation_is_none_not_error() {
        let store = MemoryStore::new();
        let result = store
            .reserve_next("de", &["jokes".to_string()], SortOrder::OldestFirst)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn operator_reset_returns_candidate_to_pending() {
        let store = MemoryStore::new();
        let id = store.seed_candidate("en", "jokes", "j", Utc::now());
        let sources = vec!["jokes".to_string()];
        store
            .reserve_next("en", &sources, SortOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.count_candidates("en", &sources).await.unwrap(), 0);

        assert!(store.mark_candidate(id, CandidateStatus::Pending).await.unwrap());
        assert_eq!(store.count_candidates("en", &sources).await.unwrap(), 1);
        assert!(store.candidate(id).unwrap().reserved_at.is_none());
    }

    #[tokio::test]
    async fn due_publications_are_claimed_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.seed_publication("pool", now - chrono::Duration::minutes(1));
        store.seed_publication("pool", now + chrono::Duration::hours(1));

        let claimed = store.claim_due_publications(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_due_publications(now, 10).await.unwrap().is_empty());
    }
}
