use std::fs;

use anyhow::{Result, anyhow};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::Point2D;
use crate::calibration::{REFERENCE_RESOLUTION, REFERENCE_SPOT_DIMENSIONS};

/// One parking spot as authored in the layout file: a stable id and a
/// top-left anchor at the reference resolution, with an optional per-spot
/// crop size override (also at reference resolution).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpotConfig {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

impl SpotConfig {
    pub fn new(id: impl Into<String>, anchor: Point2D) -> Self {
        SpotConfig {
            id: id.into(),
            x: anchor.0,
            y: anchor.1,
            width: None,
            height: None,
        }
    }

    pub fn anchor(&self) -> Point2D {
        (self.x, self.y)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LotConfig {
    /// Spot layout, authored once per physical lot at the reference
    /// resolution; immutable during a tracking session.
    pub spots: Vec<SpotConfig>,

    /// Resolution the layout (and spot crop size) was calibrated at
    pub reference_resolution: (u32, u32),
    pub reference_spot_width: u32,
    pub reference_spot_height: u32,

    // -------- MODEL-OVERLAP SETTINGS
    /// Minimum overlap ratio (intersection / spot area) for a detection to
    /// mark a spot occupied. Lower catches partially-occluded vehicles at
    /// the cost of shadow false positives; sensible range 0.15-0.40.
    pub overlap_accept_threshold: f32,

    /// Stricter minimum for explicit identity assignments (plate-reader
    /// webhook path), to avoid pinning a plate to the wrong spot
    pub assign_min_overlap: f32,

    /// Confidence floor applied at the detection adapter; kept low on
    /// purpose, the real filtering happens at assignment
    pub detection_confidence_floor: f32,

    // -------- OCCUPANCY SETTINGS
    /// How many consecutive detection-free frames before an occupied spot
    /// is committed empty. 0 vacates immediately (no debounce).
    pub vacate_grace_frames: u32,

    // -------- PIXEL-COUNT CALIBRATION SETTINGS
    /// Frames to sample when calibrating pixel-count thresholds
    pub calibration_sample_frames: usize,

    /// Pixel-count threshold used until calibration completes, or when the
    /// source has fewer frames than the sample size
    pub fallback_pixel_threshold: u32,

    /// Rolling brightness window length for recalibration detection
    pub brightness_window: usize,

    /// Brightness delta (0-255 scale) between window halves that flags
    /// recalibration
    pub recalibrate_brightness_delta: f32,
}

impl Default for LotConfig {
    fn default() -> Self {
        LotConfig {
            spots: Vec::new(),
            reference_resolution: REFERENCE_RESOLUTION,
            reference_spot_width: REFERENCE_SPOT_DIMENSIONS.0,
            reference_spot_height: REFERENCE_SPOT_DIMENSIONS.1,
            overlap_accept_threshold: 0.15,
            assign_min_overlap: 0.25,
            detection_confidence_floor: 0.10,
            vacate_grace_frames: 0,
            calibration_sample_frames: 30,
            fallback_pixel_threshold: 1200,
            brightness_window: 30,
            recalibrate_brightness_delta: 30.,
        }
    }
}

impl LotConfig {
    /// A session must not start without geometry; operating on an empty or
    /// default layout would silently report every spot as absent.
    pub fn validate(&self) -> Result<()> {
        if self.spots.is_empty() {
            return Err(anyhow!("lot config contains no parking spots"));
        }
        for spot in &self.spots {
            if spot.id.trim().is_empty() {
                return Err(anyhow!("spot at ({}, {}) has an empty id", spot.x, spot.y));
            }
        }
        let mut ids: Vec<&str> = self.spots.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.spots.len() {
            return Err(anyhow!("duplicate spot ids in lot config"));
        }
        Ok(())
    }

    pub fn spots(&self) -> &[SpotConfig] {
        &self.spots
    }

    pub fn write_config_to_file(&self, config_file_path: &str) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(config_file_path, text)?;
        info!("Wrote lot config to file: {:?}", config_file_path);
        Ok(())
    }
}

/// Load the lot configuration from disk. Unlike device-style configs there
/// is no blank-file fallback here: missing geometry is a structural error
/// and the session must refuse to start.
pub fn load_config_from_file(config_file_path: &str) -> Result<LotConfig> {
    let text = fs::read_to_string(config_file_path)
        .map_err(|e| anyhow!("failed to read lot config \"{}\": {}", config_file_path, e))?;

    let config = serde_json::from_str::<LotConfig>(&text)
        .map_err(|e| anyhow!("failed to parse lot config data: {}", e))?;

    debug!("Config parsed data from file: {:?}", &config);
    config.validate()?;
    info!(
        "Loaded lot config OK from \"{}\" ({} spots)",
        config_file_path,
        config.spots.len()
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_spots(n: usize) -> LotConfig {
        LotConfig {
            spots: (0..n)
                .map(|i| SpotConfig::new(format!("A{}", i + 1), (i as f32 * 120., 100.)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_empty_layout() {
        let config = LotConfig::default();
        assert!(config.validate().is_err());
        assert!(config_with_spots(3).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = config_with_spots(2);
        config.spots[1].id = config.spots[0].id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = config_with_spots(2);
        let text = serde_json::to_string(&config).unwrap();
        let parsed: LotConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.spots.len(), 2);
        assert_eq!(parsed.spots[0].id, "A1");
        assert_eq!(parsed.overlap_accept_threshold, 0.15);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config_from_file("/definitely/not/here.json").is_err());
    }
}
