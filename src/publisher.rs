//! Publish collaborator client and the publish-check worker.
//!
//! The worker is an apalis cron job: every tick it atomically claims due
//! planned publications and pushes each one to the channel API. Ticks are
//! additionally guarded by the shared single-flight flag so a slow upload
//! never stacks overlapping publish passes.

use apalis::prelude::*;
use apalis_cron::{CronStream, Schedule};
use apalis_sql::postgres::PostgresStorage;
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{PUBLISH_CLAIM_BATCH, PUBLISH_TIMEOUT_SECS};
use crate::models::ScheduledPublication;
use crate::singleflight::SingleFlight;
use crate::store::Store;

#[derive(Debug)]
pub enum PublishError {
    Http(reqwest::Error),
    Api(String),
    Auth(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Http(e) => write!(f, "HTTP error: {}", e),
            PublishError::Api(s) => write!(f, "publish API error: {}", s),
            PublishError::Auth(s) => write!(f, "publish auth error: {}", s),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        PublishError::Http(e)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Published {
    pub published_id: String,
    pub published_url: String,
}

/// Publish collaborator seam: push one due publication to its channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, publication: &ScheduledPublication) -> Result<Published, PublishError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    artifact_url: &'a str,
    title: &'a str,
    description: &'a str,
    tags: &'a [String],
    privacy: &'a str,
}

/// OAuth refresh-token client for the channel upload API.
#[derive(Clone)]
pub struct PublishClient {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_url: String,
    upload_url: String,
    http: reqwest::Client,
}

impl PublishClient {
    pub fn new(
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        token_url: &str,
        upload_url: &str,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: refresh_token.to_string(),
            token_url: token_url.to_string(),
            upload_url: upload_url.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(PUBLISH_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Build Basic auth header for the token endpoint
    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.client_id, self.client_secret);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }

    async fn refresh_access_token(&self) -> Result<String, PublishError> {
        let params = [
            ("refresh_token", self.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .http
            .post(&self.token_url)
            .header("Authorization", self.basic_auth_header())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(PublishError::Auth(text));
        }

        let token: TokenResponse = resp.json().await?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl Publisher for PublishClient {
    async fn publish(&self, publication: &ScheduledPublication) -> Result<Published, PublishError> {
        let access_token = self.refresh_access_token().await?;

        let url = format!(
            "{}?channel={}",
            self.upload_url,
            percent_encode(&publication.channel)
        );

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .json(&PublishRequest {
                artifact_url: &publication.artifact_url,
                title: &publication.title,
                description: &publication.description,
                tags: &publication.tags,
                privacy: &publication.privacy,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(PublishError::Api(text));
        }

        let published: Published = resp.json().await?;
        Ok(published)
    }
}

fn percent_encode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// One publish pass: claim everything due, publish each, record outcomes.
/// Returns (published, failed).
pub async fn run_publish_pass(
    store: &dyn Store,
    publisher: &dyn Publisher,
) -> Result<(usize, usize), crate::store::StoreError> {
    let due = store
        .claim_due_publications(Utc::now(), PUBLISH_CLAIM_BATCH)
        .await?;

    let mut published = 0;
    let mut failed = 0;
    for publication in due {
        match publisher.publish(&publication).await {
            Ok(result) => {
                store
                    .finish_publication(publication.id, &result.published_id, &result.published_url)
                    .await?;
                println!(
                    "[publish] Publication {} live as {} ({})",
                    publication.id, result.published_id, result.published_url
                );
                published += 1;
            }
            Err(e) => {
                store.fail_publication(publication.id, &e.to_string()).await?;
                eprintln!("[publish] Publication {} failed: {}", publication.id, e);
                failed += 1;
            }
        }
    }
    Ok((published, failed))
}

// ============== Apalis cron worker ==============

/// Job input - marker for a publish-check tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub scheduled_at: chrono::DateTime<Utc>,
}

impl From<chrono::DateTime<Utc>> for PublishJob {
    fn from(dt: chrono::DateTime<Utc>) -> Self {
        PublishJob { scheduled_at: dt }
    }
}

#[derive(Clone)]
pub struct PublishContext {
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub flight: Arc<SingleFlight>,
}

/// Tick handler - always returns Ok; a failed pass is logged and retried by
/// the next cron tick, never by apalis itself.
async fn process_publish_job(_job: PublishJob, ctx: Data<PublishContext>) -> Result<(), Error> {
    let Some(_guard) = ctx.flight.try_enter() else {
        println!("[publish] Previous check still running, skipping tick");
        return Ok(());
    };

    match run_publish_pass(ctx.store.as_ref(), ctx.publisher.as_ref()).await {
        Ok((published, failed)) => {
            if published > 0 || failed > 0 {
                println!(
                    "[publish] Check complete: {} published, {} failed",
                    published, failed
                );
            }
        }
        Err(e) => {
            eprintln!("[publish] Check error (next tick retries): {}", e);
        }
    }
    Ok(())
}

/// Start the publish-check worker on its own cron cadence.
pub async fn run_publish_worker(pool: PgPool, ctx: PublishContext, cron_seconds: u64) {
    // Run apalis migrations
    PostgresStorage::setup(&pool)
        .await
        .expect("Failed to set up apalis storage");

    let storage: PostgresStorage<PublishJob> = PostgresStorage::new(pool);
    let schedule_expr = format!("*/{} * * * * *", cron_seconds);
    let schedule = Schedule::from_str(&schedule_expr).expect("Invalid publish worker schedule");
    let cron = CronStream::new(schedule);
    let backend = cron.pipe_to_storage(storage);

    println!("[publish] Apalis worker starting (every {}s)", cron_seconds);

    let worker = WorkerBuilder::new("publish-worker")
        .data(ctx)
        .backend(backend)
        .build_fn(process_publish_job);

    Monitor::new()
        .register(worker)
        .run()
        .await
        .expect("Publish worker monitor failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::models::PublicationStatus;
    use std::sync::Mutex;

    struct FakePublisher {
        fail_on: Option<i64>,
        calls: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(
            &self,
            publication: &ScheduledPublication,
        ) -> Result<Published, PublishError> {
            self.calls.lock().unwrap().push(publication.id);
            if self.fail_on == Some(publication.id) {
                return Err(PublishError::Api("upload rejected".to_string()));
            }
            Ok(Published {
                published_id: format!("vid-{}", publication.id),
                published_url: format!("https://tube.example.com/v/{}", publication.id),
            })
        }
    }

    #[tokio::test]
    async fn due_publications_publish_and_record() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = store.seed_publication("pool", now - chrono::Duration::minutes(2));
        let future = store.seed_publication("pool", now + chrono::Duration::hours(2));

        let publisher = FakePublisher {
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        };
        let (published, failed) = run_publish_pass(&store, &publisher).await.unwrap();
        assert_eq!((published, failed), (1, 0));

        let publications = store.publications();
        let done = publications.iter().find(|p| p.id == due).unwrap();
        assert_eq!(done.status, PublicationStatus::Published);
        assert_eq!(done.published_id.as_deref(), Some(&format!("vid-{}", due)[..]));

        let pending = publications.iter().find(|p| p.id == future).unwrap();
        assert_eq!(pending.status, PublicationStatus::Planned);
    }

    #[tokio::test]
    async fn failed_upload_marks_publication_failed() {
        let store = MemoryStore::new();
        let id = store.seed_publication("pool", Utc::now() - chrono::Duration::minutes(1));
        let publisher = FakePublisher {
            fail_on: Some(id),
            calls: Mutex::new(Vec::new()),
        };
        let (published, failed) = run_publish_pass(&store, &publisher).await.unwrap();
        assert_eq!((published, failed), (0, 1));

        let publication = store.publications().into_iter().find(|p| p.id == id).unwrap();
        assert_eq!(publication.status, PublicationStatus::Failed);
        assert!(publication.error.as_deref().unwrap().contains("upload rejected"));
    }
}
