use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::{error, info};

use crate::calibration::{MIN_SPOT_DIMENSIONS, ResolutionCalibrator};
use crate::frame::Frame;
use crate::geometry::Rect;
use crate::lot_config::LotConfig;
use crate::systems::assignment::SpotRegion;
use crate::systems::occupancy::{LotStatus, OccupancyTracker, TransitionEvent};
use crate::systems::strategy::OccupancyStrategy;

/// Where frames come from. Yields `None` when the source is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Resolve the authored layout into current-frame spot rectangles:
/// anchors mapped by the per-axis resolution ratio, crop sizes scaled by
/// the width ratio with per-spot overrides honoured. With no frame size
/// available everything stays at the reference calibration.
pub fn build_spot_regions(
    config: &LotConfig,
    frame_dimensions: Option<(u32, u32)>,
) -> Result<Vec<SpotRegion>> {
    config.validate()?;

    let mut calibrator = ResolutionCalibrator::from_config(config);
    let (default_width, default_height) = calibrator.scaled_dimensions(frame_dimensions);
    let dims = frame_dimensions.unwrap_or(config.reference_resolution);
    let scale = calibrator.scale_factor(dims.0);

    let mut regions = Vec::with_capacity(config.spots().len());
    for spot in config.spots() {
        let anchor = calibrator.scale_anchor(spot.anchor(), dims);
        let width = match spot.width {
            Some(w) => (w * scale).max(MIN_SPOT_DIMENSIONS.0 as f32),
            None => default_width as f32,
        };
        let height = match spot.height {
            Some(h) => (h * scale).max(MIN_SPOT_DIMENSIONS.1 as f32),
            None => default_height as f32,
        };
        regions.push(SpotRegion {
            id: spot.id.clone(),
            rect: Rect::from_anchor_size(anchor, width, height),
        });
    }
    Ok(regions)
}

/// One tracking run over one video source with one strategy. Owns the
/// occupancy state; per-frame strategy failures are logged and skipped so a
/// single bad frame never tears down the session or its state.
pub struct TrackingSession {
    strategy: Box<dyn OccupancyStrategy>,
    tracker: OccupancyTracker,
    stop: Arc<AtomicBool>,
    frames_processed: u64,
}

impl TrackingSession {
    pub fn new(strategy: Box<dyn OccupancyStrategy>, tracker: OccupancyTracker) -> Self {
        info!("Tracking session using \"{}\" strategy", strategy.name());
        TrackingSession {
            strategy,
            tracker,
            stop: Arc::new(AtomicBool::new(false)),
            frames_processed: 0,
        }
    }

    /// Process a single frame, returning the transitions it caused. A
    /// strategy error yields no transitions and leaves all spot state
    /// untouched.
    pub fn process_frame(&mut self, frame: &Frame) -> Vec<TransitionEvent> {
        self.frames_processed += 1;
        match self.strategy.process_frame(frame) {
            Ok(assignments) => self.tracker.update(&assignments, frame.timestamp),
            Err(e) => {
                error!(
                    "Skipping frame {} ({} strategy): {}",
                    self.frames_processed,
                    self.strategy.name(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Drain the source, invoking `on_event` for every transition. Returns
    /// the number of frames consumed. Stops early when the stop handle is
    /// raised (the usual ctrl-c path).
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        mut on_event: impl FnMut(&TransitionEvent),
    ) -> Result<u64> {
        while !self.stop.load(Ordering::Relaxed) {
            let Some(frame) = source.next_frame()? else {
                break;
            };
            for event in self.process_frame(&frame) {
                on_event(&event);
            }
        }
        info!(
            "Session finished after {} frames ({} occupied of {})",
            self.frames_processed,
            self.tracker.get_status().occupied_count,
            self.tracker.get_status().total_spots
        );
        Ok(self.frames_processed)
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn status(&self) -> LotStatus {
        self.tracker.get_status()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Direct access for the identity paths (webhook assign / lookup).
    pub fn tracker_mut(&mut self) -> &mut OccupancyTracker {
        &mut self.tracker
    }

    pub fn tracker(&self) -> &OccupancyTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionAdapter, RawDetection, VehicleDetector};
    use crate::lot_config::SpotConfig;
    use crate::systems::assignment::SpotAssignmentEngine;
    use crate::systems::occupancy::Transition;
    use crate::systems::strategy::ModelOverlapStrategy;

    /// Two rows of six spots at the reference resolution.
    fn lot_config() -> LotConfig {
        let mut spots = Vec::new();
        for i in 0..6 {
            spots.push(SpotConfig::new(format!("A{}", i + 1), (i as f32 * 110., 100.)));
            spots.push(SpotConfig::new(format!("B{}", i + 1), (i as f32 * 110., 400.)));
        }
        LotConfig {
            spots,
            ..Default::default()
        }
    }

    struct ScriptedDetector {
        frames: Vec<Vec<RawDetection>>,
        cursor: usize,
    }

    impl VehicleDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
            let raw = self.frames.get(self.cursor).cloned().unwrap_or_default();
            self.cursor += 1;
            Ok(raw)
        }
    }

    fn car(bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            class: "car".into(),
            bbox,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_build_spot_regions_reference_resolution() {
        let regions = build_spot_regions(&lot_config(), Some((1280, 720))).unwrap();
        assert_eq!(regions.len(), 12);
        assert_eq!(regions[0].rect, Rect::new(0., 100., 107., 148.));
        // Second row keeps its own anchor
        assert_eq!(regions[1].rect, Rect::new(0., 400., 107., 448.));
    }

    #[test]
    fn test_build_spot_regions_scales_anchors_and_sizes() {
        let regions = build_spot_regions(&lot_config(), Some((2560, 1440))).unwrap();
        assert_eq!(regions[2].rect.x1, 220.);
        assert_eq!(regions[2].rect.width(), 214.);
        assert_eq!(regions[2].rect.height(), 96.);
    }

    #[test]
    fn test_build_spot_regions_honours_overrides() {
        let mut config = lot_config();
        config.spots[0].width = Some(200.);
        config.spots[0].height = Some(60.);
        let regions = build_spot_regions(&config, Some((1280, 720))).unwrap();
        assert_eq!(regions[0].rect.width(), 200.);
        assert_eq!(regions[0].rect.height(), 60.);
        // Others keep the calibrated default
        assert_eq!(regions[2].rect.width(), 107.);
    }

    #[test]
    fn test_build_spot_regions_rejects_empty_layout() {
        assert!(build_spot_regions(&LotConfig::default(), Some((1280, 720))).is_err());
    }

    /// Fifty frames over a 12-spot lot: four cars parked in the second row
    /// the whole time, one car sweeping across the first row. The parked
    /// spots must hold their state for the entire run while the swept spots
    /// flicker, and the final occupancy reflects only the parked cars.
    #[test]
    fn test_session_static_and_sweeping_vehicles() {
        let config = lot_config();
        let regions = build_spot_regions(&config, Some((1280, 720))).unwrap();

        let parked: Vec<[f32; 4]> = (0..4)
            .map(|i| {
                let x = i as f32 * 110.;
                [x, 400., x + 107., 448.]
            })
            .collect();

        let mut frames = Vec::new();
        for f in 0..50 {
            let mut dets: Vec<RawDetection> = parked.iter().map(|b| car(*b)).collect();
            let sweep_x = f as f32 * 30.;
            dets.push(car([sweep_x, 100., sweep_x + 107., 148.]));
            frames.push(dets);
        }

        let strategy = ModelOverlapStrategy::new(
            Box::new(ScriptedDetector { frames, cursor: 0 }),
            DetectionAdapter::new(config.detection_confidence_floor, None),
            SpotAssignmentEngine::new(regions.clone(), config.overlap_accept_threshold),
        );
        let tracker = OccupancyTracker::new(
            regions,
            config.assign_min_overlap,
            config.vacate_grace_frames,
        )
        .unwrap();
        let mut session = TrackingSession::new(Box::new(strategy), tracker);

        let mut events = Vec::new();
        for f in 0..50 {
            events.extend(session.process_frame(&Frame::dimensions_only(1280, 720, f as f64)));
        }

        // Parked spots transition exactly once, to occupied, and never back
        for id in ["B1", "B2", "B3", "B4"] {
            let for_spot: Vec<_> = events.iter().filter(|e| e.spot_id == id).collect();
            assert_eq!(for_spot.len(), 1, "spot {} flickered", id);
            assert_eq!(for_spot[0].transition, Transition::Occupied);
            assert_eq!(for_spot[0].timestamp, 0.);
        }

        // The sweep produced transient occupy/vacate pairs on the first row
        let swept: Vec<_> = events
            .iter()
            .filter(|e| e.spot_id.starts_with('A'))
            .collect();
        assert!(!swept.is_empty());
        let occupies = swept
            .iter()
            .filter(|e| e.transition == Transition::Occupied)
            .count();
        let vacates = swept
            .iter()
            .filter(|e| e.transition == Transition::Vacated)
            .count();
        assert_eq!(occupies, vacates, "every swept spot must be released");

        let status = session.status();
        assert_eq!(status.occupied_count, 4);
        assert!((status.occupancy_rate - 4. / 12.).abs() < 1e-4);
        assert_eq!(session.frames_processed(), 50);
    }

    #[test]
    fn test_detector_failure_carries_state_forward() {
        struct FlakyDetector {
            calls: u32,
        }
        impl VehicleDetector for FlakyDetector {
            fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
                self.calls += 1;
                if self.calls == 1 {
                    Ok(vec![car([0., 100., 107., 148.])])
                } else {
                    Err(anyhow::anyhow!("camera glitch"))
                }
            }
        }

        let config = lot_config();
        let regions = build_spot_regions(&config, Some((1280, 720))).unwrap();
        let strategy = ModelOverlapStrategy::new(
            Box::new(FlakyDetector { calls: 0 }),
            DetectionAdapter::new(0.1, None),
            SpotAssignmentEngine::new(regions.clone(), 0.15),
        );
        let tracker = OccupancyTracker::new(regions, 0.25, 0).unwrap();
        let mut session = TrackingSession::new(Box::new(strategy), tracker);

        let events = session.process_frame(&Frame::dimensions_only(1280, 720, 1.0));
        assert_eq!(events.len(), 1);
        assert_eq!(session.status().occupied_count, 1);

        // Failed frames produce no transitions and leave the state as-is,
        // rather than vacating everything
        for f in 2..6 {
            let events = session.process_frame(&Frame::dimensions_only(1280, 720, f as f64));
            assert!(events.is_empty());
        }
        assert_eq!(session.status().occupied_count, 1);
    }

    #[test]
    fn test_run_drains_source_and_stops() {
        struct CountedSource {
            left: u32,
        }
        impl FrameSource for CountedSource {
            fn next_frame(&mut self) -> Result<Option<Frame>> {
                if self.left == 0 {
                    return Ok(None);
                }
                self.left -= 1;
                Ok(Some(Frame::dimensions_only(1280, 720, 0.)))
            }
        }

        let config = lot_config();
        let regions = build_spot_regions(&config, Some((1280, 720))).unwrap();
        let strategy = ModelOverlapStrategy::new(
            Box::new(ScriptedDetector {
                frames: Vec::new(),
                cursor: 0,
            }),
            DetectionAdapter::new(0.1, None),
            SpotAssignmentEngine::new(regions.clone(), 0.15),
        );
        let tracker = OccupancyTracker::new(regions, 0.25, 0).unwrap();
        let mut session = TrackingSession::new(Box::new(strategy), tracker);

        let consumed = session
            .run(&mut CountedSource { left: 7 }, |_| {})
            .unwrap();
        assert_eq!(consumed, 7);

        // A raised stop handle prevents any further consumption
        session.stop_handle().store(true, Ordering::Relaxed);
        let consumed = session
            .run(&mut CountedSource { left: 7 }, |_| {})
            .unwrap();
        assert_eq!(consumed, 7);
    }
}
