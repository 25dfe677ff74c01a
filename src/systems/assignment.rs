use indexmap::IndexMap;
use serde::Serialize;

use crate::detection::{Detection, VehicleClass};
use crate::geometry::Rect;

/// A spot's rectangle in current-frame coordinates, resolved once per
/// session from the authored layout and the resolution calibrator.
#[derive(Debug, Clone)]
pub struct SpotRegion {
    pub id: String,
    pub rect: Rect,
}

/// Per-spot outcome for one frame.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpotAssignment {
    pub occupied: bool,
    pub confidence: f32,
    pub vehicle_class: Option<VehicleClass>,
    pub overlap_ratio: f32,
}

impl SpotAssignment {
    fn available() -> Self {
        SpotAssignment {
            occupied: false,
            confidence: 0.,
            vehicle_class: None,
            overlap_ratio: 0.,
        }
    }
}

#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub total_spots: usize,
    pub occupied_count: usize,
    pub available_count: usize,
    /// Fraction in [0,1]
    pub occupancy_rate: f32,
    /// Mean confidence over occupied assignments (0 when none)
    pub mean_confidence: f32,
}

/// The result of matching one frame's detections against the spot grid.
#[derive(Serialize, Debug, Clone)]
pub struct FrameAssignments {
    pub spots: IndexMap<String, SpotAssignment>,
    pub stats: FrameStats,
}

/// Decides, per frame, which spots are covered by which detections. A spot
/// is occupied if any detection reaches the acceptance threshold on
/// overlap ratio; when several qualify, the one with the largest
/// intersection area provides the occupant metadata. A detection is never
/// split across spots for that purpose.
pub struct SpotAssignmentEngine {
    regions: Vec<SpotRegion>,
    accept_threshold: f32,
}

impl SpotAssignmentEngine {
    pub fn new(regions: Vec<SpotRegion>, accept_threshold: f32) -> Self {
        SpotAssignmentEngine {
            regions,
            accept_threshold,
        }
    }

    pub fn regions(&self) -> &[SpotRegion] {
        &self.regions
    }

    pub fn assign(&self, detections: &[Detection]) -> FrameAssignments {
        let mut spots = IndexMap::with_capacity(self.regions.len());
        let mut occupied_count = 0;
        let mut confidence_sum = 0.;

        for region in &self.regions {
            let spot_area = region.rect.area();
            let mut best: Option<(f32, f32, &Detection)> = None; // (intersection area, overlap, det)

            for detection in detections {
                let Some(overlap_rect) = region.rect.intersection(&detection.bbox) else {
                    continue;
                };
                let intersection_area = overlap_rect.area();
                let overlap_ratio = if spot_area > 0. {
                    intersection_area / spot_area
                } else {
                    0.
                };
                if overlap_ratio < self.accept_threshold {
                    continue;
                }
                let replace = match best {
                    None => true,
                    Some((best_area, _, _)) => intersection_area > best_area,
                };
                if replace {
                    best = Some((intersection_area, overlap_ratio, detection));
                }
            }

            let assignment = match best {
                Some((_, overlap_ratio, detection)) => {
                    occupied_count += 1;
                    confidence_sum += detection.confidence;
                    SpotAssignment {
                        occupied: true,
                        confidence: detection.confidence,
                        vehicle_class: Some(detection.class),
                        overlap_ratio,
                    }
                }
                None => SpotAssignment::available(),
            };
            spots.insert(region.id.clone(), assignment);
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

        FrameAssignments { spots, stats }
    }
}
