//! Typed filter-graph construction.
//!
//! The composition compiles to a tree of named filter nodes assembled into
//! labeled chains, validated structurally, and only then rendered to the
//! backend's `-filter_complex` syntax. Call sites never concatenate filter
//! strings themselves.

use crate::compose::{MotionEffect, OverlayAnimation};

// Animation curve constants. All curves are functions of elapsed time `t`
// only; there is no per-frame randomness.
const PULSE_AMPLITUDE_PX: f64 = 12.0;
const PULSE_PERIOD_SECS: f64 = 1.2;
const ROTATE_RADIUS_PX: f64 = 16.0;
const ROTATE_PERIOD_SECS: f64 = 2.0;
const BOUNCE_AMPLITUDE_PX: f64 = 40.0;
const BOUNCE_PERIOD_SECS: f64 = 0.8;
pub const FADE_IN_SECS: f64 = 0.5;

const ZOOM_IN_MAX: f64 = 1.25;
const ZOOM_IN_OUT_AMPLITUDE: f64 = 0.25;
const PAN_ZOOM: f64 = 1.15;

#[derive(Debug, Clone)]
pub struct DrawTextParams {
    pub text: String,
    pub fontfile: String,
    pub font_size: u32,
    pub color: String,
    pub x_expr: String,
    pub y_expr: String,
    pub boxed: bool,
    pub box_color: String,
    pub box_border: u32,
    pub alpha_expr: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Filter {
    /// Scale to cover the target rect, preserving aspect.
    ScaleCover { width: u32, height: u32 },
    /// Scale to a fixed width, height follows aspect (overlay media).
    ScaleWidth { width: u32 },
    Crop { width: u32, height: u32 },
    SetSar,
    Format { pixel: &'static str },
    ZoomPan {
        zoom: String,
        x: String,
        y: String,
        frames: u64,
        fps: u32,
        width: u32,
        height: u32,
    },
    DrawText(DrawTextParams),
    FadeInAlpha { duration: f64 },
    Overlay { x: String, y: String },
    ATrim { start: f64, end: f64 },
    ASetPts,
}

impl Filter {
    fn compile(&self) -> String {
        match self {
            Filter::ScaleCover { width, height } => format!(
                "scale={}:{}:force_original_aspect_ratio=increase",
                width, height
            ),
            Filter::ScaleWidth { width } => format!("scale={}:-2", width),
            Filter::Crop { width, height } => format!("crop={}:{}", width, height),
            Filter::SetSar => "setsar=1".to_string(),
            Filter::Format { pixel } => format!("format={}", pixel),
            Filter::ZoomPan {
                zoom,
                x,
                y,
                frames,
                fps,
                width,
                height,
            } => format!(
                "zoompan=z='{}':x='{}':y='{}':d={}:s={}x{}:fps={}",
                zoom, x, y, frames, width, height, fps
            ),
            Filter::DrawText(p) => {
                let mut out = format!(
                    "drawtext=fontfile={}:text='{}':fontsize={}:fontcolor={}:x={}:y={}",
                    p.fontfile,
                    escape_drawtext(&p.text),
                    p.font_size,
                    p.color,
                    p.x_expr,
                    p.y_expr
                );
                if let Some(alpha) = &p.alpha_expr {
                    out.push_str(&format!(":alpha='{}'", alpha));
                }
                if p.boxed {
                    out.push_str(&format!(
                        ":box=1:boxcolor={}:boxborderw={}",
                        p.box_color, p.box_border
                    ));
                }
                out
            }
            Filter::FadeInAlpha { duration } => {
                format!("fade=t=in:st=0:d={}:alpha=1", duration)
            }
            Filter::Overlay { x, y } => format!("overlay=x='{}':y='{}'", x, y),
            Filter::ATrim { start, end } => format!("atrim=start={}:end={}", start, end),
            Filter::ASetPts => "asetpts=PTS-STARTPTS".to_string(),
        }
    }
}

/// One labeled chain: `[in..]filter,filter[out]`.
#[derive(Debug, Clone)]
pub struct FilterChain {
    pub inputs: Vec<String>,
    pub filters: Vec<Filter>,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct FilterGraph {
    pub chains: Vec<FilterChain>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GraphError {
    EmptyGraph,
    EmptyChain(String),
    UnknownInput(String),
    DuplicateOutput(String),
    DanglingOutput(String),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::EmptyGraph => write!(f, "filter graph has no chains"),
            GraphError::EmptyChain(label) => write!(f, "chain [{}] has no filters", label),
            GraphError::UnknownInput(label) => {
                write!(f, "chain input [{}] is not a stream or prior output", label)
            }
            GraphError::DuplicateOutput(label) => {
                write!(f, "output label [{}] defined twice", label)
            }
            GraphError::DanglingOutput(label) => {
                write!(f, "output label [{}] is neither consumed nor mapped", label)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Raw input stream specifier like `0:v` / `2:a`.
fn is_stream_ref(label: &str) -> bool {
    let mut parts = label.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(idx), Some(kind)) => {
            idx.chars().all(|c| c.is_ascii_digit()) && (kind == "v" || kind == "a")
        }
        _ => false,
    }
}

impl FilterGraph {
    /// Structural validation: every chain has filters, every input is a
    /// stream ref or an earlier chain's output, labels are unique, and every
    /// intermediate output is consumed. `mapped` lists labels the caller
    /// maps out of the graph.
    pub fn validate(&self, mapped: &[&str]) -> Result<(), GraphError> {
        if self.chains.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut defined: Vec<&str> = Vec::new();
        let mut consumed: Vec<&str> = Vec::new();

        for chain in &self.chains {
            if chain.filters.is_empty() {
                return Err(GraphError::EmptyChain(chain.output.clone()));
            }
            for input in &chain.inputs {
                if is_stream_ref(input) {
                    continue;
                }
                if defined.contains(&input.as_str()) {
                    consumed.push(input.as_str());
                } else {
                    return Err(GraphError::UnknownInput(input.clone()));
                }
            }
            if defined.contains(&chain.output.as_str()) {
                return Err(GraphError::DuplicateOutput(chain.output.clone()));
            }
            defined.push(&chain.output);
        }

        for label in &defined {
            if !consumed.contains(label) && !mapped.contains(label) {
                return Err(GraphError::DanglingOutput((*label).to_string()));
            }
        }
        Ok(())
    }

    pub fn compile(&self) -> String {
        self.chains
            .iter()
            .map(|chain| {
                let inputs: String = chain
                    .inputs
                    .iter()
                    .map(|i| format!("[{}]", i))
                    .collect();
                let body: Vec<String> = chain.filters.iter().map(Filter::compile).collect();
                format!("{}{}[{}]", inputs, body.join(","), chain.output)
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Drawtext treats `\ ' : %` specially. The apostrophe is swapped for its
/// typographic twin instead of escaped; drawtext quoting does not nest.
pub fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\u{2019}")
        .replace(':', "\\:")
        .replace('%', "\\%")
        .replace('\n', " ")
}

/// Overlay position expressions for an animation kind, anchored at (x, y).
pub fn overlay_position(animation: OverlayAnimation, x: i32, y: i32) -> (String, String) {
    match animation {
        OverlayAnimation::None | OverlayAnimation::Fade => (x.to_string(), y.to_string()),
        OverlayAnimation::Pulse => (
            format!("{}+{}*sin(2*PI*t/{})", x, PULSE_AMPLITUDE_PX, PULSE_PERIOD_SECS),
            format!("{}+{}*sin(2*PI*t/{})", y, PULSE_AMPLITUDE_PX, PULSE_PERIOD_SECS),
        ),
        OverlayAnimation::Rotate => (
            format!("{}+{}*cos(2*PI*t/{})", x, ROTATE_RADIUS_PX, ROTATE_PERIOD_SECS),
            format!("{}+{}*sin(2*PI*t/{})", y, ROTATE_RADIUS_PX, ROTATE_PERIOD_SECS),
        ),
        OverlayAnimation::Bounce => (
            x.to_string(),
            format!("{}-{}*abs(sin(PI*t/{}))", y, BOUNCE_AMPLITUDE_PX, BOUNCE_PERIOD_SECS),
        ),
    }
}

/// Alpha ramp for fading drawtext overlays: 0 -> 1 over the fade window,
/// then hold.
pub fn fade_alpha_expr() -> String {
    format!("min(t/{},1)", FADE_IN_SECS)
}

/// Camera-motion node for a still-image background, or `None` when no
/// effect is requested.
pub fn zoompan_for(
    effect: MotionEffect,
    frames: u64,
    fps: u32,
    width: u32,
    height: u32,
) -> Option<Filter> {
    let centered_x = "iw/2-(iw/zoom/2)".to_string();
    let centered_y = "ih/2-(ih/zoom/2)".to_string();
    let frames = frames.max(1);

    let (zoom, x, y) = match effect {
        MotionEffect::None => return None,
        MotionEffect::ZoomIn => (
            format!("min(1+{:.6}*on,{})", (ZOOM_IN_MAX - 1.0) / frames as f64, ZOOM_IN_MAX),
            centered_x,
            centered_y,
        ),
        MotionEffect::ZoomInOut => (
            format!("1+{}*sin(PI*on/{})", ZOOM_IN_OUT_AMPLITUDE, frames),
            centered_x,
            centered_y,
        ),
        MotionEffect::Pan => (
            format!("{}", PAN_ZOOM),
            format!("(iw-iw/zoom)*on/{}", frames),
            centered_y,
        ),
    };

    Some(Filter::ZoomPan {
        zoom,
        x,
        y,
        frames,
        fps,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bg_chain() -> FilterChain {
        FilterChain {
            inputs: vec!["0:v".to_string()],
            filters: vec![
                Filter::ScaleCover { width: 720, height: 1280 },
                Filter::Crop { width: 720, height: 1280 },
                Filter::SetSar,
            ],
            output: "bg".to_string(),
        }
    }

    #[test]
    fn compiles_chain_syntax() {
        let graph = FilterGraph { chains: vec![bg_chain()] };
        assert_eq!(
            graph.compile(),
            "[0:v]scale=720:1280:force_original_aspect_ratio=increase,crop=720:1280,setsar=1[bg]"
        );
    }

    #[test]
    fn validates_labels_connect() {
        let graph = FilterGraph {
            chains: vec![
                bg_chain(),
                FilterChain {
                    inputs: vec!["1:v".to_string()],
                    filters: vec![Filter::ScaleWidth { width: 160 }],
                    output: "gif".to_string(),
                },
                FilterChain {
                    inputs: vec!["bg".to_string(), "gif".to_string()],
                    filters: vec![Filter::Overlay {
                        x: "40".to_string(),
                        y: "60".to_string(),
                    }],
                    output: "vout".to_string(),
                },
            ],
        };
        assert!(graph.validate(&["vout"]).is_ok());
    }

    #[test]
    fn rejects_unknown_input() {
        let graph = FilterGraph {
            chains: vec![FilterChain {
                inputs: vec!["nope".to_string()],
                filters: vec![Filter::SetSar],
                output: "vout".to_string(),
            }],
        };
        assert_eq!(
            graph.validate(&["vout"]),
            Err(GraphError::UnknownInput("nope".to_string()))
        );
    }

    #[test]
    fn rejects_dangling_intermediate() {
        let graph = FilterGraph {
            chains: vec![bg_chain()],
        };
        assert_eq!(
            graph.validate(&["vout"]),
            Err(GraphError::DanglingOutput("bg".to_string()))
        );
    }

    #[test]
    fn rejects_duplicate_output_label() {
        let graph = FilterGraph {
            chains: vec![bg_chain(), bg_chain()],
        };
        assert_eq!(
            graph.validate(&["bg"]),
            Err(GraphError::DuplicateOutput("bg".to_string()))
        );
    }

    #[test]
    fn drawtext_escaping() {
        assert_eq!(escape_drawtext("50% off: don't"), "50\\% off\\: don\u{2019}t");
    }

    #[test]
    fn animation_curves_are_time_deterministic() {
        let (x, y) = overlay_position(OverlayAnimation::Bounce, 100, 900);
        assert_eq!(x, "100");
        assert_eq!(y, "900-40*abs(sin(PI*t/0.8))");

        let (x, y) = overlay_position(OverlayAnimation::Rotate, 50, 60);
        assert!(x.contains("cos(2*PI*t/2)") || x.contains("cos(2*PI*t/2.0)"));
        assert!(y.contains("sin"));

        // no random() anywhere in any curve
        for anim in [
            OverlayAnimation::None,
            OverlayAnimation::Pulse,
            OverlayAnimation::Rotate,
            OverlayAnimation::Bounce,
            OverlayAnimation::Fade,
        ] {
            let (x, y) = overlay_position(anim, 0, 0);
            assert!(!x.contains("random") && !y.contains("random"));
        }
    }

    #[test]
    fn zoompan_only_when_effect_requested() {
        assert!(zoompan_for(MotionEffect::None, 300, 30, 720, 1280).is_none());
        let Some(Filter::ZoomPan { zoom, .. }) =
            zoompan_for(MotionEffect::ZoomIn, 300, 30, 720, 1280)
        else {
            panic!("expected zoompan");
        };
        assert!(zoom.starts_with("min(1+"));
    }
}
