use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::Point2D;
use crate::lot_config::LotConfig;
use crate::systems::adaptive::ThresholdSummary;

/// Resolution the spot layout (and reference crop size) was authored at.
pub const REFERENCE_RESOLUTION: (u32, u32) = (1280, 720);

/// Spot crop size measured at the reference resolution.
pub const REFERENCE_SPOT_DIMENSIONS: (u32, u32) = (107, 48);

/// Scaled crops never shrink below this, so absurdly small streams still
/// produce usable regions.
pub const MIN_SPOT_DIMENSIONS: (u32, u32) = (50, 30);

/// Derives spot crop dimensions for the current frame size by scaling the
/// reference calibration. Pure with respect to frame size; the result is
/// cached per size so per-frame lookups are free.
#[derive(Debug, Clone)]
pub struct ResolutionCalibrator {
    reference_resolution: (u32, u32),
    reference_spot: (u32, u32),
    min_spot: (u32, u32),
    cache: Option<((u32, u32), (u32, u32))>,
}

impl ResolutionCalibrator {
    pub fn new(reference_resolution: (u32, u32), reference_spot: (u32, u32)) -> Self {
        ResolutionCalibrator {
            reference_resolution,
            reference_spot,
            min_spot: MIN_SPOT_DIMENSIONS,
            cache: None,
        }
    }

    pub fn from_config(config: &LotConfig) -> Self {
        ResolutionCalibrator::new(
            config.reference_resolution,
            (config.reference_spot_width, config.reference_spot_height),
        )
    }

    /// Spot crop dimensions for the given frame size, scaled by the width
    /// ratio and clamped to the minimum. `None` (frame unreadable) falls
    /// back to the reference dimensions unscaled.
    pub fn scaled_dimensions(&mut self, frame_dimensions: Option<(u32, u32)>) -> (u32, u32) {
        let Some((frame_width, frame_height)) = frame_dimensions else {
            warn!("Frame dimensions unavailable; using reference spot dimensions");
            return self.reference_spot;
        };

        if let Some((cached_size, dims)) = self.cache {
            if cached_size == (frame_width, frame_height) {
                return dims;
            }
        }

        let scale = self.scale_factor(frame_width);
        let width = ((self.reference_spot.0 as f32 * scale) as u32).max(self.min_spot.0);
        let height = ((self.reference_spot.1 as f32 * scale) as u32).max(self.min_spot.1);

        info!(
            "Frame {}x{}: scale factor {:.2}, spot crop {}x{} (reference {}x{})",
            frame_width,
            frame_height,
            scale,
            width,
            height,
            self.reference_spot.0,
            self.reference_spot.1
        );

        self.cache = Some(((frame_width, frame_height), (width, height)));
        (width, height)
    }

    /// Width-ratio scale factor (1.0 at the reference resolution).
    pub fn scale_factor(&self, frame_width: u32) -> f32 {
        frame_width as f32 / self.reference_resolution.0 as f32
    }

    /// Map an anchor authored at the reference resolution into
    /// current-frame coordinates.
    pub fn scale_anchor(&self, anchor: Point2D, frame_dimensions: (u32, u32)) -> Point2D {
        let (frame_width, frame_height) = frame_dimensions;
        let scale_x = frame_width as f32 / self.reference_resolution.0 as f32;
        let scale_y = frame_height as f32 / self.reference_resolution.1 as f32;
        (anchor.0 * scale_x, anchor.1 * scale_y)
    }

    pub fn reference_spot_dimensions(&self) -> (u32, u32) {
        self.reference_spot
    }
}

/// All session-scoped tuning derived once per video/camera source. The
/// profile is replaced wholesale on recalibration (callers hold it behind
/// an `Arc` and swap the pointer) so readers never see a torn mix of old
/// and new thresholds.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationProfile {
    pub reference_resolution: (u32, u32),
    pub reference_spot_dimensions: (u32, u32),
    pub scale_factor: f32,

    // Pixel-count strategy thresholds
    pub occupied_threshold: u32,
    pub empty_threshold: u32,
    pub low_threshold: u32,
    pub high_threshold: u32,

    // Model-overlap strategy thresholds
    pub overlap_accept_threshold: f32,
    pub assign_min_overlap: f32,
    pub detection_confidence_floor: f32,
}

impl CalibrationProfile {
    /// Profile seeded from config defaults, before (or instead of) any
    /// frame sampling.
    pub fn from_config(config: &LotConfig, frame_width: u32) -> Self {
        let fallback = config.fallback_pixel_threshold;
        CalibrationProfile {
            reference_resolution: config.reference_resolution,
            reference_spot_dimensions: (config.reference_spot_width, config.reference_spot_height),
            scale_factor: frame_width as f32 / config.reference_resolution.0 as f32,
            occupied_threshold: fallback,
            empty_threshold: fallback * 3 / 5,
            low_threshold: fallback * 3 / 5,
            high_threshold: fallback * 7 / 5,
            overlap_accept_threshold: config.overlap_accept_threshold,
            assign_min_overlap: config.assign_min_overlap,
            detection_confidence_floor: config.detection_confidence_floor,
        }
    }

    /// A new profile carrying sampled pixel-count thresholds; overlap
    /// settings are retained from the current profile.
    pub fn with_thresholds(&self, summary: &ThresholdSummary) -> Self {
        let mut next = self.clone();
        next.occupied_threshold = summary.optimal;
        next.empty_threshold = summary.mean_empty;
        next.low_threshold = summary.low;
        next.high_threshold = summary.high;
        next
    }
}
