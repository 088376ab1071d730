//! Resource preparation: audio trim windows, random pickers, media probing.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::constants::PROBE_TIMEOUT_SECS;

/// Seconds-based trim window into a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimWindow {
    pub start: f64,
    pub end: f64,
}

impl TrimWindow {
    pub fn len(&self) -> f64 {
        self.end - self.start
    }
}

/// Pick the audio window for a track of real duration `duration`.
///
/// Shorter-than-target tracks are used whole. With randomization off the
/// window starts at zero; otherwise the start is uniform over what keeps the
/// full target length inside the track.
pub fn compute_trim_window(
    duration: f64,
    target: f64,
    randomize: bool,
    rng: &mut impl Rng,
) -> TrimWindow {
    if duration <= target {
        return TrimWindow {
            start: 0.0,
            end: duration,
        };
    }
    if !randomize {
        return TrimWindow {
            start: 0.0,
            end: target,
        };
    }
    let start = rng.random_range(0.0..=duration - target);
    TrimWindow {
        start,
        end: start + target,
    }
}

const DIRECT_MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "wav", "ogg", "oga", "flac", "mp4", "webm", "mov",
];

/// Audio references must point at a direct media file before any trim
/// attempt; page URLs and the like are treated as "no audio available".
pub fn has_direct_media_extension(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit_once('.') {
        Some((_, ext)) => DIRECT_MEDIA_EXTENSIONS
            .iter()
            .any(|known| ext.eq_ignore_ascii_case(known)),
        None => false,
    }
}

/// Uniform choice over a list; `None` on an empty list.
pub fn pick_random<'a, T>(items: &'a [T], rng: &mut impl Rng) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    let idx = rng.random_range(0..items.len());
    Some(&items[idx])
}

#[derive(Debug)]
pub enum ProbeError {
    Spawn(std::io::Error),
    Failed(String),
    Unparsable(String),
    Timeout,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Spawn(e) => write!(f, "failed to spawn ffprobe: {}", e),
            ProbeError::Failed(s) => write!(f, "ffprobe failed: {}", s),
            ProbeError::Unparsable(s) => write!(f, "unparsable ffprobe output: {}", s),
            ProbeError::Timeout => write!(f, "ffprobe timed out"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Media probe collaborator: real duration of a media reference in seconds.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn duration(&self, media_ref: &str) -> Result<f64, ProbeError>;
}

/// Shells out to `ffprobe` with an explicit timeout. Works on local paths
/// and direct http(s) URLs alike.
pub struct FfprobeProber {
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn duration(&self, media_ref: &str) -> Result<f64, ProbeError> {
        let run = Command::new("ffprobe")
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(media_ref)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| ProbeError::Unparsable(stdout.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_track_is_used_whole() {
        let mut rng = rand::rng();
        let w = compute_trim_window(6.0, 10.0, true, &mut rng);
        assert_eq!(w, TrimWindow { start: 0.0, end: 6.0 });
    }

    #[test]
    fn unrandomized_window_starts_at_zero() {
        let mut rng = rand::rng();
        let w = compute_trim_window(20.0, 10.0, false, &mut rng);
        assert_eq!(w, TrimWindow { start: 0.0, end: 10.0 });
    }

    #[test]
    fn randomized_window_has_exact_target_length() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let w = compute_trim_window(20.0, 10.0, true, &mut rng);
            assert!((w.len() - 10.0).abs() < 1e-9);
            assert!(w.start >= 0.0 && w.start <= 10.0);
        }
    }

    #[test]
    fn direct_extension_gate() {
        assert!(has_direct_media_extension("https://cdn.example.com/track.mp3"));
        assert!(has_direct_media_extension("https://cdn.example.com/track.MP3?sig=abc"));
        assert!(has_direct_media_extension("/srv/audio/loop.wav"));
        assert!(!has_direct_media_extension("https://example.com/player?id=9"));
        assert!(!has_direct_media_extension("https://example.com/track.html"));
    }

    #[test]
    fn picker_is_none_on_empty() {
        let mut rng = rand::rng();
        let empty: Vec<String> = Vec::new();
        assert!(pick_random(&empty, &mut rng).is_none());

        let items = vec!["a", "b", "c"];
        for _ in 0..20 {
            let picked = pick_random(&items, &mut rng).unwrap();
            assert!(items.contains(picked));
        }
    }
}
