use std::collections::VecDeque;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::foreground::{count_nonzero, extract_foreground};
use crate::frame::Frame;
use crate::systems::assignment::SpotRegion;

/// Bias multiplier applied to the midpoint threshold: ambiguous pixel
/// counts lean toward "occupied", since a missed car is worse than an
/// extra alert.
const OCCUPIED_BIAS: f32 = 1.05;

/// Groups at the distribution tails need at least this many samples before
/// their mean is trusted over the raw percentile.
const MIN_GROUP_SAMPLES: usize = 5;

/// Data-driven occupied/empty pixel-count split for a video source,
/// replacing fixed magic numbers that break across resolutions and
/// lighting.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSummary {
    pub optimal: u32,
    /// More lenient variant for bright/clear conditions
    pub low: u32,
    /// Stricter variant for dark/shadowy conditions
    pub high: u32,
    pub mean_empty: u32,
    pub mean_occupied: u32,
    pub brightness_avg: f32,
    pub contrast_avg: f32,
    pub std_dev: f32,
    pub samples_analyzed: usize,
}

/// Samples the first N frames of a session, pushing every spot crop's
/// foreground pixel count into a pool, then derives thresholds from the
/// pool's percentile structure.
pub struct ThresholdCalibrator {
    sample_frame_count: usize,
    pixel_counts: Vec<u32>,
    brightness_values: Vec<f32>,
    contrast_values: Vec<f32>,
    frames_seen: usize,
}

impl ThresholdCalibrator {
    pub fn new(sample_frame_count: usize) -> Self {
        ThresholdCalibrator {
            sample_frame_count,
            pixel_counts: Vec::new(),
            brightness_values: Vec::new(),
            contrast_values: Vec::new(),
            frames_seen: 0,
        }
    }

    /// Feed one sampled frame; returns true once enough frames have been
    /// analyzed.
    pub fn add_frame(&mut self, frame: &Frame, regions: &[SpotRegion]) -> Result<bool> {
        let gray = frame.to_gray()?;
        let foreground = extract_foreground(&gray);

        for region in regions {
            self.pixel_counts
                .push(count_nonzero(&foreground, &region.rect));
        }
        self.brightness_values.push(gray.mean_brightness());
        self.contrast_values.push(gray.contrast());
        self.frames_seen += 1;

        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.frames_seen >= self.sample_frame_count
    }

    /// Derive the thresholds. If the source ran out of frames before the
    /// sample size was reached, falls back to the documented default
    /// rather than failing the session.
    pub fn finish(&self, fallback_threshold: u32) -> ThresholdSummary {
        if self.frames_seen < self.sample_frame_count || self.pixel_counts.is_empty() {
            warn!(
                "Calibration sample starvation ({} of {} frames); using fallback threshold {}",
                self.frames_seen, self.sample_frame_count, fallback_threshold
            );
            return ThresholdSummary {
                optimal: fallback_threshold,
                low: fallback_threshold * 3 / 5,
                high: fallback_threshold * 7 / 5,
                mean_empty: 0,
                mean_occupied: fallback_threshold * 2,
                brightness_avg: mean_f32(&self.brightness_values),
                contrast_avg: mean_f32(&self.contrast_values),
                std_dev: 0.,
                samples_analyzed: self.pixel_counts.len(),
            };
        }

        let mut sorted = self.pixel_counts.clone();
        sorted.sort_unstable();

        let p10 = percentile(&sorted, 10.);
        let p25 = percentile(&sorted, 25.);
        let p75 = percentile(&sorted, 75.);
        let p90 = percentile(&sorted, 90.);

        // Inner-quartile split: the low tail is confidently empty, the
        // high tail confidently occupied
        let empty_group: Vec<u32> = sorted.iter().copied().filter(|&c| (c as f32) <= p25).collect();
        let occupied_group: Vec<u32> =
            sorted.iter().copied().filter(|&c| (c as f32) >= p75).collect();

        let mean_empty = if empty_group.len() >= MIN_GROUP_SAMPLES {
            mean_u32(&empty_group)
        } else {
            p10
        };
        let mean_occupied = if occupied_group.len() >= MIN_GROUP_SAMPLES {
            mean_u32(&occupied_group)
        } else {
            p90
        };

        let optimal = (mean_empty + mean_occupied) / 2. * OCCUPIED_BIAS;
        let low = mean_empty + (optimal - mean_empty) * 0.6;
        let high = mean_occupied - (mean_occupied - optimal) * 0.6;

        let summary = ThresholdSummary {
            optimal: optimal as u32,
            low: low as u32,
            high: high as u32,
            mean_empty: mean_empty as u32,
            mean_occupied: mean_occupied as u32,
            brightness_avg: mean_f32(&self.brightness_values),
            contrast_avg: mean_f32(&self.contrast_values),
            std_dev: std_dev_u32(&sorted),
            samples_analyzed: sorted.len(),
        };
        info!(
            "Calibrated thresholds from {} samples: optimal {}, low {}, high {}",
            summary.samples_analyzed, summary.optimal, summary.low, summary.high
        );
        summary
    }

    /// Inject raw pixel-count samples directly (synthetic calibration and
    /// tests).
    pub fn add_samples(&mut self, counts: &[u32], brightness: f32, contrast: f32) {
        self.pixel_counts.extend_from_slice(counts);
        self.brightness_values.push(brightness);
        self.contrast_values.push(contrast);
        self.frames_seen += 1;
    }
}

/// Per-frame threshold adjustment plus recalibration detection from a
/// rolling brightness window.
pub struct AdaptiveThreshold {
    base_threshold: u32,
    window: usize,
    recalibrate_delta: f32,
    brightness_history: VecDeque<f32>,
    threshold_history: VecDeque<u32>,
    last_threshold: u32,
}

impl AdaptiveThreshold {
    pub fn new(base_threshold: u32, window: usize, recalibrate_delta: f32) -> Self {
        AdaptiveThreshold {
            base_threshold,
            window,
            recalibrate_delta,
            brightness_history: VecDeque::with_capacity(window),
            threshold_history: VecDeque::with_capacity(window),
            last_threshold: base_threshold,
        }
    }

    /// Threshold for the current frame: the base nudged by brightness
    /// (conservative +/-15%) and smoothed over recent frames with heavier
    /// weight on the newest, to avoid jitter.
    pub fn threshold_for(&mut self, brightness: f32) -> u32 {
        push_capped(&mut self.brightness_history, brightness, self.window);

        let factor = (1.0 + (brightness - 127.) / 127. * 0.15).clamp(0.85, 1.15);
        let adjusted = (self.base_threshold as f32 * factor) as u32;
        push_capped(&mut self.threshold_history, adjusted, self.window);

        let n = self.threshold_history.len();
        let mut weighted_sum = 0.;
        let mut weight_sum = 0.;
        for (i, &t) in self.threshold_history.iter().enumerate() {
            let weight = if n > 1 {
                0.5 + i as f32 / (n - 1) as f32
            } else {
                1.
            };
            weighted_sum += t as f32 * weight;
            weight_sum += weight;
        }

        self.last_threshold = (weighted_sum / weight_sum) as u32;
        self.last_threshold
    }

    pub fn last_threshold(&self) -> u32 {
        self.last_threshold
    }

    /// Has ambient brightness shifted enough that the calibrated
    /// thresholds are stale? Compares the older half of the window against
    /// the recent half; requires a full window so a cold start never
    /// triggers.
    pub fn should_recalibrate(&self) -> bool {
        if self.brightness_history.len() < self.window || self.window < 2 {
            return false;
        }
        let half = self.window / 2;
        let older: f32 =
            self.brightness_history.iter().take(half).sum::<f32>() / half as f32;
        let recent: f32 = self
            .brightness_history
            .iter()
            .skip(self.brightness_history.len() - half)
            .sum::<f32>()
            / half as f32;
        (recent - older).abs() > self.recalibrate_delta
    }

    /// Adopt a freshly calibrated base threshold and clear the histories,
    /// so the recalibration that just happened does not immediately
    /// re-trigger.
    pub fn reset(&mut self, base_threshold: u32) {
        self.base_threshold = base_threshold;
        self.brightness_history.clear();
        self.threshold_history.clear();
        self.last_threshold = base_threshold;
    }
}

fn push_capped<T>(queue: &mut VecDeque<T>, value: T, cap: usize) {
    if queue.len() == cap {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// Linear-interpolated percentile over a sorted slice.
pub fn percentile(sorted: &[u32], p: f32) -> f32 {
    if sorted.is_empty() {
        return 0.;
    }
    if sorted.len() == 1 {
        return sorted[0] as f32;
    }
    let rank = p / 100. * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = rank - lo as f32;
    sorted[lo] as f32 + frac * (sorted[hi] as f32 - sorted[lo] as f32)
}

fn mean_u32(values: &[u32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }
    values.iter().map(|&v| v as f32).sum::<f32>() / values.len() as f32
}

fn mean_f32(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn std_dev_u32(values: &[u32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }
    let mean = mean_u32(values);
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / values.len() as f32;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolation() {
        let sorted = vec![0, 10, 20, 30, 40];
        assert_eq!(percentile(&sorted, 0.), 0.);
        assert_eq!(percentile(&sorted, 50.), 20.);
        assert_eq!(percentile(&sorted, 100.), 40.);
        assert_eq!(percentile(&sorted, 25.), 10.);
    }

    #[test]
    fn test_bimodal_split_lands_between_modes() {
        let mut calibrator = ThresholdCalibrator::new(1);
        // 100 samples near 200 (empty) and 100 near 2000 (occupied)
        let mut counts = Vec::new();
        for i in 0..100u32 {
            counts.push(180 + i % 40);
            counts.push(1980 + i % 40);
        }
        calibrator.add_samples(&counts, 120., 40.);

        let summary = calibrator.finish(1200);
        assert!(
            summary.optimal > 250 && summary.optimal < 1950,
            "optimal {} not between modes",
            summary.optimal
        );
        assert!(summary.mean_empty < 250);
        assert!(summary.mean_occupied > 1950);
        assert!(summary.low < summary.optimal);
        assert!(summary.high > summary.optimal);
    }

    #[test]
    fn test_occupied_bias_applied() {
        let mut calibrator = ThresholdCalibrator::new(1);
        let counts: Vec<u32> = (0..50).map(|_| 200).chain((0..50).map(|_| 2000)).collect();
        calibrator.add_samples(&counts, 120., 40.);
        let summary = calibrator.finish(1200);
        // Midpoint is 1100; the 5% bias pushes it to 1155
        assert_eq!(summary.optimal, 1155);
    }

    #[test]
    fn test_sample_starvation_falls_back() {
        let calibrator = ThresholdCalibrator::new(30);
        let summary = calibrator.finish(1200);
        assert_eq!(summary.optimal, 1200);
        assert_eq!(summary.samples_analyzed, 0);
    }

    #[test]
    fn test_incomplete_sampling_falls_back() {
        let mut calibrator = ThresholdCalibrator::new(30);
        calibrator.add_samples(&[100, 2000], 120., 40.);
        assert!(!calibrator.is_complete());
        let summary = calibrator.finish(900);
        assert_eq!(summary.optimal, 900);
    }

    #[test]
    fn test_adaptive_threshold_tracks_brightness() {
        let mut adaptive = AdaptiveThreshold::new(1000, 30, 30.);
        // Neutral brightness: factor 1.0
        let neutral = adaptive.threshold_for(127.);
        assert_eq!(neutral, 1000);

        // Very bright frames raise the threshold, capped at +15%
        let mut adaptive = AdaptiveThreshold::new(1000, 30, 30.);
        for _ in 0..30 {
            adaptive.threshold_for(255.);
        }
        assert!(adaptive.last_threshold() > 1000);
        assert!(adaptive.last_threshold() <= 1150);

        // Very dark frames lower it, capped at -15%
        let mut adaptive = AdaptiveThreshold::new(1000, 30, 30.);
        for _ in 0..30 {
            adaptive.threshold_for(0.);
        }
        assert!(adaptive.last_threshold() < 1000);
        assert!(adaptive.last_threshold() >= 850);
    }

    #[test]
    fn test_recalibration_triggers_on_brightness_jump() {
        let mut adaptive = AdaptiveThreshold::new(1000, 30, 30.);
        for _ in 0..15 {
            adaptive.threshold_for(100.);
        }
        // Not yet a full window
        assert!(!adaptive.should_recalibrate());
        for _ in 0..15 {
            adaptive.threshold_for(160.);
        }
        assert!(adaptive.should_recalibrate());
    }

    #[test]
    fn test_flat_brightness_never_triggers() {
        let mut adaptive = AdaptiveThreshold::new(1000, 30, 30.);
        for _ in 0..100 {
            adaptive.threshold_for(128.);
        }
        assert!(!adaptive.should_recalibrate());
    }

    #[test]
    fn test_reset_clears_trigger() {
        let mut adaptive = AdaptiveThreshold::new(1000, 30, 30.);
        for _ in 0..15 {
            adaptive.threshold_for(100.);
        }
        for _ in 0..15 {
            adaptive.threshold_for(160.);
        }
        assert!(adaptive.should_recalibrate());
        adaptive.reset(1400);
        assert!(!adaptive.should_recalibrate());
        assert_eq!(adaptive.last_threshold(), 1400);
    }
}
