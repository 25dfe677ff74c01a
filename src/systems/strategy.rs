use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use log::info;

use crate::calibration::CalibrationProfile;
use crate::detection::{DetectionAdapter, VehicleDetector};
use crate::foreground::{count_nonzero, extract_foreground};
use crate::frame::Frame;
use crate::systems::adaptive::{AdaptiveThreshold, ThresholdCalibrator};
use crate::systems::assignment::{
    FrameAssignments, FrameStats, SpotAssignment, SpotAssignmentEngine, SpotRegion,
};

/// Reported confidence when the pixel counter marks a spot occupied;
/// counting foreground texture is inherently less certain than a model
/// detection.
const PIXEL_OCCUPIED_CONFIDENCE: f32 = 0.85;
const PIXEL_EMPTY_CONFIDENCE: f32 = 0.90;

/// How a session decides per-spot occupancy from a frame. Exactly one
/// strategy runs per session; their signals are never blended.
pub trait OccupancyStrategy {
    fn process_frame(&mut self, frame: &Frame) -> Result<FrameAssignments>;
    fn name(&self) -> &'static str;
}

/// Primary strategy: boxes from an external vision model, matched against
/// the spot grid by overlap ratio.
pub struct ModelOverlapStrategy {
    detector: Box<dyn VehicleDetector>,
    adapter: DetectionAdapter,
    engine: SpotAssignmentEngine,
}

impl ModelOverlapStrategy {
    pub fn new(
        detector: Box<dyn VehicleDetector>,
        adapter: DetectionAdapter,
        engine: SpotAssignmentEngine,
    ) -> Self {
        ModelOverlapStrategy {
            detector,
            adapter,
            engine,
        }
    }
}

impl OccupancyStrategy for ModelOverlapStrategy {
    fn process_frame(&mut self, frame: &Frame) -> Result<FrameAssignments> {
        let raw = self.detector.detect(frame)?;
        let detections = self.adapter.normalize(&raw);
        Ok(self.engine.assign(&detections))
    }

    fn name(&self) -> &'static str {
        "model-overlap"
    }
}

/// Fallback strategy for deployments without a vision model: counts
/// foreground pixels per spot crop against calibrated thresholds.
///
/// Calibration is streaming: the first `sample_frames` frames are sampled
/// while the session keeps answering with the current (fallback-seeded)
/// thresholds, then the profile is swapped wholesale. A sustained
/// brightness shift later re-runs the same sampling with the old profile
/// still in effect.
pub struct PixelCountStrategy {
    profile: Arc<CalibrationProfile>,
    regions: Vec<SpotRegion>,
    adaptive: AdaptiveThreshold,
    calibrator: Option<ThresholdCalibrator>,
    sample_frames: usize,
    fallback_threshold: u32,
}

impl PixelCountStrategy {
    pub fn new(
        profile: Arc<CalibrationProfile>,
        regions: Vec<SpotRegion>,
        sample_frames: usize,
        brightness_window: usize,
        recalibrate_delta: f32,
        fallback_threshold: u32,
    ) -> Self {
        let adaptive = AdaptiveThreshold::new(
            profile.occupied_threshold,
            brightness_window,
            recalibrate_delta,
        );
        PixelCountStrategy {
            profile,
            regions,
            adaptive,
            calibrator: Some(ThresholdCalibrator::new(sample_frames)),
            sample_frames,
            fallback_threshold,
        }
    }

    /// The active calibration profile. Swapped as a whole when sampling
    /// completes, never field by field.
    pub fn profile(&self) -> Arc<CalibrationProfile> {
        Arc::clone(&self.profile)
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrator.is_some()
    }
}

impl OccupancyStrategy for PixelCountStrategy {
    fn process_frame(&mut self, frame: &Frame) -> Result<FrameAssignments> {
        let gray = frame.to_gray()?;
        let foreground = extract_foreground(&gray);
        let brightness = gray.mean_brightness();

        let counts: Vec<u32> = self
            .regions
            .iter()
            .map(|region| count_nonzero(&foreground, &region.rect))
            .collect();

        if let Some(calibrator) = &mut self.calibrator {
            calibrator.add_samples(&counts, brightness, gray.contrast());
            if calibrator.is_complete() {
                let summary = calibrator.finish(self.fallback_threshold);
                self.profile = Arc::new(self.profile.with_thresholds(&summary));
                self.adaptive.reset(summary.optimal);
                self.calibrator = None;
            }
        } else if self.adaptive.should_recalibrate() {
            info!("Sustained brightness shift detected; resampling pixel-count thresholds");
            self.calibrator = Some(ThresholdCalibrator::new(self.sample_frames));
        }

        let threshold = self.adaptive.threshold_for(brightness);

        let mut spots = IndexMap::with_capacity(self.regions.len());
        let mut occupied_count = 0;
        let mut confidence_sum = 0.;
        for (region, &count) in self.regions.iter().zip(&counts) {
            let occupied = count >= threshold;
            let confidence = if occupied {
                occupied_count += 1;
                confidence_sum += PIXEL_OCCUPIED_CONFIDENCE;
                PIXEL_OCCUPIED_CONFIDENCE
            } else {
                PIXEL_EMPTY_CONFIDENCE
            };
            spots.insert(
                region.id.clone(),
                SpotAssignment {
                    occupied,
                    confidence,
                    vehicle_class: None,
                    overlap_ratio: 0.,
                },
            );
        }

        let total_spots = self.regions.len();
        let stats = FrameStats {
            total_spots,
            occupied_count,
            available_count: total_spots - occupied_count,
            occupancy_rate: if total_spots > 0 {
                occupied_count as f32 / total_spots as f32
            } else {
                0.
            },
            mean_confidence: if occupied_count > 0 {
                confidence_sum / occupied_count as f32
            } else {
                0.
            },
        };

        Ok(FrameAssignments { spots, stats })
    }

    fn name(&self) -> &'static str {
        "pixel-count"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::RawDetection;
    use crate::geometry::Rect;
    use crate::lot_config::LotConfig;

    struct FixedDetector {
        raw: Vec<RawDetection>,
    }

    impl VehicleDetector for FixedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
            Ok(self.raw.clone())
        }
    }

    fn regions() -> Vec<SpotRegion> {
        vec![
            SpotRegion {
                id: "A1".into(),
                rect: Rect::new(0., 0., 32., 64.),
            },
            SpotRegion {
                id: "A2".into(),
                rect: Rect::new(32., 0., 64., 64.),
            },
        ]
    }

    /// 64x64 frame, bright background, optional dark blob inside A1.
    fn frame(with_vehicle: bool) -> Frame {
        let mut data = Vec::with_capacity(64 * 64 * 3);
        for y in 0..64usize {
            for x in 0..64usize {
                let v = if with_vehicle && (8..24).contains(&x) && (24..40).contains(&y) {
                    30
                } else {
                    200
                };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::from_rgb(data, 64, 64, 0.).unwrap()
    }

    #[test]
    fn test_model_strategy_marks_detected_spot() {
        let detector = FixedDetector {
            raw: vec![RawDetection {
                class: "car".into(),
                bbox: [0., 0., 32., 64.],
                confidence: 0.9,
            }],
        };
        let mut strategy = ModelOverlapStrategy::new(
            Box::new(detector),
            DetectionAdapter::new(0.1, None),
            SpotAssignmentEngine::new(regions(), 0.15),
        );
        let result = strategy
            .process_frame(&Frame::dimensions_only(64, 64, 0.))
            .unwrap();
        assert!(result.spots["A1"].occupied);
        assert!(!result.spots["A2"].occupied);
        assert_eq!(strategy.name(), "model-overlap");
    }

    fn pixel_strategy(sample_frames: usize, window: usize) -> PixelCountStrategy {
        let profile = CalibrationProfile::from_config(&LotConfig::default(), 64);
        PixelCountStrategy::new(
            Arc::new(profile),
            regions(),
            sample_frames,
            window,
            30.,
            1200,
        )
    }

    #[test]
    fn test_pixel_strategy_calibrates_then_detects() {
        let mut strategy = pixel_strategy(2, 30);
        assert!(strategy.is_calibrating());

        // Sampling frames alternate occupied/empty in A1, A2 always empty
        strategy.process_frame(&frame(true)).unwrap();
        strategy.process_frame(&frame(false)).unwrap();
        assert!(!strategy.is_calibrating());
        // Sampled threshold replaced the fallback seed
        assert_ne!(strategy.profile().occupied_threshold, 1200);

        let occupied = strategy.process_frame(&frame(true)).unwrap();
        assert!(occupied.spots["A1"].occupied);
        assert!(!occupied.spots["A2"].occupied);
        assert_eq!(occupied.spots["A1"].confidence, PIXEL_OCCUPIED_CONFIDENCE);
        assert!((occupied.stats.occupancy_rate - 0.5).abs() < 1e-6);

        let empty = strategy.process_frame(&frame(false)).unwrap();
        assert!(!empty.spots["A1"].occupied);
        assert_eq!(empty.stats.occupied_count, 0);
    }

    #[test]
    fn test_pixel_strategy_resamples_on_brightness_shift() {
        let mut strategy = pixel_strategy(2, 6);
        strategy.process_frame(&frame(false)).unwrap();
        strategy.process_frame(&frame(false)).unwrap();
        assert!(!strategy.is_calibrating());

        // Bright for the older half of the window, then a sustained dark
        // scene; the half-window averages drift apart past the delta
        let dark = Frame::from_rgb(vec![40; 64 * 64 * 3], 64, 64, 0.).unwrap();
        strategy.process_frame(&frame(false)).unwrap();
        strategy.process_frame(&frame(false)).unwrap();
        for _ in 0..5 {
            strategy.process_frame(&dark).unwrap();
        }
        assert!(strategy.is_calibrating());
    }

    #[test]
    fn test_pixel_strategy_requires_pixels() {
        let mut strategy = pixel_strategy(2, 30);
        assert!(
            strategy
                .process_frame(&Frame::dimensions_only(64, 64, 0.))
                .is_err()
        );
    }
}
