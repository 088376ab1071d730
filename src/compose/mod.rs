//! Render composition model.
//!
//! A `RenderComposition` is an ephemeral, never-persisted description of all
//! visual/audio layers for one render: background + wrapped text + animated
//! overlays + trimmed audio, at a fixed canvas size and target duration. It
//! is constructed fresh per job and discarded after rendering.

pub mod graph;
pub mod render;
pub mod text;

use serde::{Deserialize, Serialize};

use crate::resources::TrimWindow;

pub use render::{FfmpegRenderer, RenderBackend, RenderError};

/// Camera-motion curve applied to still-image backgrounds. A continuous
/// function of time over the full duration, never a single static frame
/// when an effect is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionEffect {
    None,
    ZoomIn,
    ZoomInOut,
    Pan,
}

/// Overlay animation kind. All curves are deterministic functions of
/// elapsed time only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayAnimation {
    None,
    Pulse,
    Rotate,
    Bounce,
    Fade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundRef {
    Video(String),
    Image(String),
}

impl BackgroundRef {
    const VIDEO_EXTENSIONS: &'static [&'static str] = &["mp4", "webm", "mov", "mkv", "avi"];

    /// Classify a background reference by file extension; anything that is
    /// not a known video container is treated as an image.
    pub fn from_url(url: &str) -> BackgroundRef {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let is_video = path
            .rsplit_once('.')
            .map(|(_, ext)| {
                Self::VIDEO_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
            .unwrap_or(false);
        if is_video {
            BackgroundRef::Video(url.to_string())
        } else {
            BackgroundRef::Image(url.to_string())
        }
    }

    pub fn url(&self) -> &str {
        match self {
            BackgroundRef::Video(u) | BackgroundRef::Image(u) => u,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Background {
    pub media: BackgroundRef,
    pub effect: MotionEffect,
}

/// Pixel coordinate or auto-center. The sentinel value -1 on either axis
/// means "center on that axis".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coord {
    Px(i32),
    Centered,
}

impl Coord {
    pub fn from_sentinel(value: i32) -> Coord {
        if value < 0 { Coord::Centered } else { Coord::Px(value) }
    }
}

#[derive(Debug, Clone)]
pub struct TextBlock {
    pub text: String,
    pub x: Coord,
    pub y: Coord,
    pub wrap_width: u32,
    pub font_size: u32,
    pub color: String,
    pub bold: bool,
    pub boxed: bool,
}

#[derive(Debug, Clone)]
pub enum OverlayMedia {
    Emoji(String),
    Gif(String),
}

#[derive(Debug, Clone)]
pub struct OverlayElement {
    pub media: OverlayMedia,
    pub x: i32,
    pub y: i32,
    pub size: u32,
    pub animation: OverlayAnimation,
}

#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub url: String,
    pub trim: TrimWindow,
}

#[derive(Debug, Clone)]
pub struct RenderComposition {
    pub background: Background,
    pub text_blocks: Vec<TextBlock>,
    pub overlays: Vec<OverlayElement>,
    pub audio: Option<AudioTrack>,
    pub duration: f64,
}
