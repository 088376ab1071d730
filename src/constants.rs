//! Application constants

/// Output canvas width for rendered videos (vertical 9:16)
pub const CANVAS_WIDTH: u32 = 720;

/// Output canvas height for rendered videos (vertical 9:16)
pub const CANVAS_HEIGHT: u32 = 1280;

/// Output frame rate
pub const OUTPUT_FPS: u32 = 30;

/// GCS bucket name for rendered artifacts
pub const BUCKET_NAME: &str = "shortreel_artifacts";

/// Timeout for media probe calls (ffprobe) in seconds
pub const PROBE_TIMEOUT_SECS: u64 = 20;

/// Timeout for staging remote media inputs in seconds
pub const STAGE_TIMEOUT_SECS: u64 = 60;

/// Timeout for publish collaborator calls in seconds
pub const PUBLISH_TIMEOUT_SECS: u64 = 120;

/// Max due publications claimed per publish tick
pub const PUBLISH_CLAIM_BATCH: i64 = 8;
