//! Generation orchestrator.
//!
//! One pass advances one pool by up to its remaining daily budget:
//! reserve candidate -> prepare resources -> build composition -> render ->
//! schedule publication -> persist. Mandatory failures (background, text,
//! render) fail the job and leave the candidate reserved; optional failures
//! (audio, gif) are swallowed and logged at the point of use. The same
//! generic pass serves every pool; language, sources, sort order, slots and
//! template all come from the `PoolConfig`.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::compose::{
    AudioTrack, Background, BackgroundRef, Coord, OverlayElement, OverlayMedia, RenderBackend,
    RenderComposition, RenderError, TextBlock,
};
use crate::config::{BackgroundSource, PoolConfig, TextStyle};
use crate::models::{CandidateStatus, ContentCandidate, JobStatus};
use crate::providers::{GenerationClient, GenerationKind, ProviderError};
use crate::resources::{
    MediaProber, compute_trim_window, has_direct_media_extension, pick_random,
};
use crate::schedule;
use crate::singleflight::SingleFlight;
use crate::storage::{ArtifactStore, StorageError};
use crate::store::{NewPublication, Store, StoreError};

#[derive(Debug)]
pub enum GenerateError {
    /// Missing/invalid background or text - aborts the job.
    MandatoryResource(String),
    /// Compositor/backend failure - aborts the job, candidate stays reserved.
    Render(RenderError),
    /// Generated-background provider failure; quota exhaustion stays
    /// distinguishable through the inner error.
    Provider(ProviderError),
    Artifact(StorageError),
    Store(StoreError),
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateError::MandatoryResource(s) => write!(f, "mandatory resource failure: {}", s),
            GenerateError::Render(e) => write!(f, "render failed: {}", e),
            GenerateError::Provider(e) => write!(f, "background generation failed: {}", e),
            GenerateError::Artifact(e) => write!(f, "artifact upload failed: {}", e),
            GenerateError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for GenerateError {}

impl From<StoreError> for GenerateError {
    fn from(e: StoreError) -> Self {
        GenerateError::Store(e)
    }
}

/// Everything a generation pass needs, behind the external-collaborator
/// seams.
#[derive(Clone)]
pub struct GenerationDeps {
    pub store: Arc<dyn Store>,
    pub prober: Arc<dyn MediaProber>,
    pub renderer: Arc<dyn RenderBackend>,
    pub artifacts: Arc<ArtifactStore>,
    pub generation: Option<Arc<GenerationClient>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub generated: usize,
    pub failed: usize,
    pub skipped_slots: usize,
}

/// Run one generation pass for one pool.
///
/// Only successful generations count toward the daily cap; unavailable
/// slots are skipped (not an error) and a failed candidate consumes its
/// slot attempt for this tick without being retried in-process.
pub async fn run_generation_pass(
    deps: &GenerationDeps,
    pool: &PoolConfig,
    now: DateTime<Utc>,
) -> Result<PassSummary, StoreError> {
    let mut summary = PassSummary::default();

    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    let day_end = day_start + Duration::days(1) - Duration::seconds(1);
    let planned_today = deps
        .store
        .planned_between(pool.owner(), day_start, day_end)
        .await?
        .len();

    let budget = (pool.videos_per_day as usize).saturating_sub(planned_today);
    if budget == 0 {
        println!(
            "[generate] Pool {} - daily cap reached ({} planned)",
            pool.name, planned_today
        );
        return Ok(summary);
    }

    let slots = schedule::slots_ahead(&pool.slots, now, pool.hours_ahead);
    let mut booked = deps
        .store
        .planned_between(
            pool.owner(),
            now - Duration::minutes(pool.tolerance_minutes),
            now + Duration::hours(pool.hours_ahead) + Duration::minutes(pool.tolerance_minutes),
        )
        .await?;

    for slot in slots {
        if summary.generated >= budget {
            break;
        }
        if !schedule::is_available(slot, &booked, pool.tolerance_minutes) {
            summary.skipped_slots += 1;
            continue;
        }

        let Some(candidate) = deps
            .store
            .reserve_next(&pool.language, &pool.sources, pool.order)
            .await?
        else {
            // expected outcome, not an error: the pool is drained
            println!("[generate] Pool {} - no candidates available", pool.name);
            break;
        };

        let job_id = deps.store.insert_job(&pool.name, candidate.id).await?;
        println!(
            "[generate] Pool {} - job {} reserving candidate {} for slot {}",
            pool.name, job_id, candidate.id, slot
        );

        match process_candidate(deps, pool, &candidate, job_id, slot).await {
            Ok(publication_id) => {
                println!(
                    "[generate] Pool {} - job {} completed, publication {} at {}",
                    pool.name, job_id, publication_id, slot
                );
                booked.push(slot);
                summary.generated += 1;
            }
            Err(e) => {
                // no rollback to pending: a future tick reserves a
                // different candidate, never this one again
                eprintln!("[generate] Pool {} - job {} failed: {}", pool.name, job_id, e);
                if let Err(mark_err) = deps.store.fail_job(job_id, &e.to_string()).await {
                    eprintln!(
                        "[generate] Pool {} - failed to record job {} failure: {}",
                        pool.name, job_id, mark_err
                    );
                }
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// Run the full pipeline for one reserved candidate against one target slot.
async fn process_candidate(
    deps: &GenerationDeps,
    pool: &PoolConfig,
    candidate: &ContentCandidate,
    job_id: i64,
    slot: DateTime<Utc>,
) -> Result<i64, GenerateError> {
    let prepared = prepare_resources(deps, pool, candidate).await?;

    deps.store
        .set_job_resources(
            job_id,
            Some(prepared.background_url.as_str()),
            prepared
                .audio
                .as_ref()
                .map(|track| (track.url.as_str(), track.trim)),
            prepared.gif_url.as_deref(),
        )
        .await?;

    let artifact = deps
        .renderer
        .render(&prepared.composition)
        .await
        .map_err(GenerateError::Render)?;

    let artifact_path = format!("artifacts/{}/{}.mp4", pool.name, job_id);
    let artifact_url = deps
        .artifacts
        .store(&artifact_path, &artifact)
        .await
        .map_err(GenerateError::Artifact)?;

    let publication_id = deps
        .store
        .insert_publication(&NewPublication {
            owner: pool.owner().to_string(),
            artifact_url: artifact_url.clone(),
            title: pool.publish.render_title(candidate),
            description: pool.publish.render_description(candidate),
            tags: pool.publish.tags.clone(),
            channel: pool.channel.clone(),
            privacy: pool.privacy.clone(),
            scheduled_at: slot,
        })
        .await?;

    deps.store
        .complete_job(job_id, &artifact_url, publication_id)
        .await?;
    deps.store
        .mark_candidate(candidate.id, CandidateStatus::Used)
        .await?;

    Ok(publication_id)
}

struct PreparedResources {
    composition: RenderComposition,
    background_url: String,
    audio: Option<AudioTrack>,
    gif_url: Option<String>,
}

async fn prepare_resources(
    deps: &GenerationDeps,
    pool: &PoolConfig,
    candidate: &ContentCandidate,
) -> Result<PreparedResources, GenerateError> {
    let template = &pool.template;

    let body_text = candidate.display_text().trim().to_string();
    if body_text.is_empty() {
        return Err(GenerateError::MandatoryResource(
            "candidate has no text".to_string(),
        ));
    }

    // Background is mandatory. A candidate image (news/memes) wins over the
    // template source.
    let background_url = match &candidate.image_url {
        Some(image) => image.clone(),
        None => match &template.background {
            BackgroundSource::Library { urls } => {
                let picked = {
                    let mut rng = rand::rng();
                    pick_random(urls, &mut rng).cloned()
                };
                picked.ok_or_else(|| {
                    GenerateError::MandatoryResource("background library is empty".to_string())
                })?
            }
            BackgroundSource::Generated { prompt } => {
                let client = deps.generation.as_ref().ok_or_else(|| {
                    GenerateError::MandatoryResource(
                        "generated background requested but no generation client configured"
                            .to_string(),
                    )
                })?;
                client
                    .generate(GenerationKind::Background, prompt)
                    .await
                    .map_err(GenerateError::Provider)?
            }
        },
    };

    let audio = prepare_audio(deps, pool).await;
    let (overlay, gif_url) = prepare_overlay(pool);

    let mut text_blocks = Vec::new();
    if let (Some(style), Some(title)) = (&template.title, candidate.display_title()) {
        text_blocks.push(text_block(style, title));
    }
    text_blocks.push(text_block(&template.body, &body_text));

    let composition = RenderComposition {
        background: Background {
            media: BackgroundRef::from_url(&background_url),
            effect: template.background_effect,
        },
        text_blocks,
        overlays: overlay.into_iter().collect(),
        audio: audio.clone(),
        duration: template.target_duration,
    };

    Ok(PreparedResources {
        composition,
        background_url,
        audio,
        gif_url,
    })
}

/// Audio is optional: any failure here degrades to a silent video.
async fn prepare_audio(deps: &GenerationDeps, pool: &PoolConfig) -> Option<AudioTrack> {
    let template = &pool.template;
    let picked = {
        let mut rng = rand::rng();
        pick_random(&template.audio_tracks, &mut rng).cloned()
    };
    let url = match picked {
        Some(url) => url,
        None => {
            let (prompt, client) = (template.audio_prompt.as_ref()?, deps.generation.as_ref()?);
            match client.generate(GenerationKind::Audio, prompt).await {
                Ok(url) => url,
                Err(e) => {
                    println!(
                        "[generate] Pool {} - audio generation failed ({}), proceeding without audio",
                        pool.name, e
                    );
                    return None;
                }
            }
        }
    };

    if !has_direct_media_extension(&url) {
        println!(
            "[generate] Pool {} - audio {} has no direct file extension, proceeding without audio",
            pool.name, url
        );
        return None;
    }

    let duration = match deps.prober.duration(&url).await {
        Ok(d) => d,
        Err(e) => {
            println!(
                "[generate] Pool {} - audio probe failed ({}), proceeding without audio",
                pool.name, e
            );
            return None;
        }
    };

    let trim = {
        let mut rng = rand::rng();
        compute_trim_window(
            duration,
            template.target_duration,
            template.randomize_audio_start,
            &mut rng,
        )
    };
    Some(AudioTrack { url, trim })
}

/// Gif/emoji overlay is optional; an empty gif list just means no overlay.
fn prepare_overlay(pool: &PoolConfig) -> (Option<OverlayElement>, Option<String>) {
    let Some(cfg) = &pool.template.overlay else {
        return (None, None);
    };

    if let Some(glyph) = &cfg.emoji {
        let element = OverlayElement {
            media: OverlayMedia::Emoji(glyph.clone()),
            x: cfg.x,
            y: cfg.y,
            size: cfg.size,
            animation: cfg.animation,
        };
        return (Some(element), None);
    }

    let picked = {
        let mut rng = rand::rng();
        pick_random(&pool.template.gifs, &mut rng).cloned()
    };
    match picked {
        Some(url) => {
            let element = OverlayElement {
                media: OverlayMedia::Gif(url.clone()),
                x: cfg.x,
                y: cfg.y,
                size: cfg.size,
                animation: cfg.animation,
            };
            (Some(element), Some(url))
        }
        None => {
            println!(
                "[generate] Pool {} - overlay configured but gif list is empty, skipping",
                pool.name
            );
            (None, None)
        }
    }
}

fn text_block(style: &TextStyle, text: &str) -> TextBlock {
    TextBlock {
        text: text.to_string(),
        x: Coord::from_sentinel(style.x),
        y: Coord::from_sentinel(style.y),
        wrap_width: style.wrap_width,
        font_size: style.font_size,
        color: style.color.clone(),
        bold: style.bold,
        boxed: style.boxed,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunJobOutcome {
    /// The job already completed; no second publication is created.
    AlreadyCompleted,
    NotFound,
    UnknownPool,
    Reprocessed { publication_id: i64 },
    Failed(String),
}

/// On-demand (re-)run of one job by id, the manual retry path for failed
/// jobs. Idempotent on completed jobs.
pub async fn run_job(
    deps: &GenerationDeps,
    pools: &[PoolConfig],
    job_id: i64,
) -> Result<RunJobOutcome, StoreError> {
    let Some(job) = deps.store.get_job(job_id).await? else {
        return Ok(RunJobOutcome::NotFound);
    };
    if job.status == JobStatus::Completed {
        return Ok(RunJobOutcome::AlreadyCompleted);
    }
    let Some(pool) = pools.iter().find(|p| p.name == job.pool) else {
        return Ok(RunJobOutcome::UnknownPool);
    };
    let Some(candidate) = deps.store.get_candidate(job.candidate_id).await? else {
        return Ok(RunJobOutcome::Failed(format!(
            "candidate {} no longer exists",
            job.candidate_id
        )));
    };

    let now = Utc::now();
    let booked = deps
        .store
        .planned_between(
            pool.owner(),
            now - Duration::minutes(pool.tolerance_minutes),
            now + Duration::hours(pool.hours_ahead) + Duration::minutes(pool.tolerance_minutes),
        )
        .await?;
    let slot = schedule::slots_ahead(&pool.slots, now, pool.hours_ahead)
        .into_iter()
        .find(|slot| schedule::is_available(*slot, &booked, pool.tolerance_minutes));
    let Some(slot) = slot else {
        return Ok(RunJobOutcome::Failed("no available publish slot".to_string()));
    };

    deps.store.bump_job_retry(job_id).await?;
    match process_candidate(deps, pool, &candidate, job_id, slot).await {
        Ok(publication_id) => Ok(RunJobOutcome::Reprocessed { publication_id }),
        Err(e) => {
            deps.store.fail_job(job_id, &e.to_string()).await?;
            Ok(RunJobOutcome::Failed(e.to_string()))
        }
    }
}

/// Background loop: one pass per pool per tick, guarded by the shared
/// single-flight flag. A pool's pass error is logged and never kills the
/// scheduler.
pub async fn run_generation_scheduler(
    deps: GenerationDeps,
    pools: Vec<PoolConfig>,
    interval_secs: u64,
    flight: Arc<SingleFlight>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    println!(
        "[scheduler] Generation scheduler started ({}s interval, {} pools)",
        interval_secs,
        pools.len()
    );

    loop {
        interval.tick().await;

        let Some(_guard) = flight.try_enter() else {
            println!("[scheduler] Previous generation run still in flight, skipping tick");
            continue;
        };

        for pool in &pools {
            match run_generation_pass(&deps, pool, Utc::now()).await {
                Ok(summary) => {
                    if summary.generated > 0 || summary.failed > 0 {
                        println!(
                            "[scheduler] Pool {} - {} generated, {} failed, {} slots skipped",
                            pool.name, summary.generated, summary.failed, summary.skipped_slots
                        );
                    }
                }
                Err(e) => {
                    eprintln!("[scheduler] Pool {} - pass error: {}", pool.name, e);
                }
            }
        }
    }
}
