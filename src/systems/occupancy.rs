use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use log::{debug, info};
use serde::Serialize;

use crate::detection::VehicleClass;
use crate::geometry::{Rect, distance_points};
use crate::systems::assignment::{FrameAssignments, SpotRegion};

/// Current belief state for one spot.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyRecord {
    pub occupied: bool,
    /// Best-effort vehicle tag (plate text or opaque id) when one has been
    /// committed through `assign`; model-only occupancy carries no identity
    pub identity: Option<String>,
    pub confidence: f32,
    pub vehicle_class: Option<VehicleClass>,
    pub since: f64,
    #[serde(skip)]
    miss_streak: u32,
}

impl OccupancyRecord {
    fn empty() -> Self {
        OccupancyRecord {
            occupied: false,
            identity: None,
            confidence: 0.,
            vehicle_class: None,
            since: 0.,
            miss_streak: 0,
        }
    }

    fn clear(&mut self, timestamp: f64) {
        self.occupied = false;
        self.identity = None;
        self.confidence = 0.;
        self.vehicle_class = None;
        self.since = timestamp;
        self.miss_streak = 0;
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Occupied,
    Vacated,
}

/// The observable event stream: emitted whenever a spot flips state.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub spot_id: String,
    pub transition: Transition,
    pub identity: Option<String>,
    pub timestamp: f64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParkEvent {
    Parked,
    Vacated,
}

/// One entry in a vehicle's parking history.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event: ParkEvent,
    pub spot_id: String,
    pub timestamp: f64,
    pub confidence: f32,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpotStatus {
    pub id: String,
    pub occupied: bool,
    pub identity: Option<String>,
    pub confidence: f32,
    pub vehicle_class: Option<VehicleClass>,
    pub since: f64,
}

/// Owned, internally-consistent snapshot of the whole lot; always reflects
/// a whole number of applied frames.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LotStatus {
    pub total_spots: usize,
    pub occupied_count: usize,
    pub available_count: usize,
    /// Fraction in [0,1]
    pub occupancy_rate: f32,
    pub spots: Vec<SpotStatus>,
    pub updated_at: f64,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssignOutcome {
    pub success: bool,
    pub spot_id: Option<String>,
    pub overlap: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AssignOutcome {
    fn rejected(spot_id: Option<String>, overlap: f32, reason: impl Into<String>) -> Self {
        AssignOutcome {
            success: false,
            spot_id,
            overlap,
            reason: Some(reason.into()),
        }
    }
}

/// Turns per-frame assignment output into stable per-spot occupancy state,
/// and answers identity-level queries ("where is vehicle X parked").
///
/// All mutation happens through `&mut self`, so a frame's update is atomic
/// with respect to any snapshot taken via `get_status`.
pub struct OccupancyTracker {
    regions: Vec<SpotRegion>,
    records: IndexMap<String, OccupancyRecord>,
    history: IndexMap<String, Vec<HistoryEvent>>,
    assign_min_overlap: f32,
    vacate_grace_frames: u32,
    last_update: f64,
}

impl OccupancyTracker {
    /// Fails when no geometry is available: the tracker must surface "not
    /// initialized" rather than operate on an empty layout.
    pub fn new(
        regions: Vec<SpotRegion>,
        assign_min_overlap: f32,
        vacate_grace_frames: u32,
    ) -> Result<Self> {
        if regions.is_empty() {
            return Err(anyhow!(
                "cannot start occupancy tracker: no spot geometry loaded"
            ));
        }
        let records = regions
            .iter()
            .map(|r| (r.id.clone(), OccupancyRecord::empty()))
            .collect();
        Ok(OccupancyTracker {
            regions,
            records,
            history: IndexMap::new(),
            assign_min_overlap,
            vacate_grace_frames,
            last_update: 0.,
        })
    }

    /// Apply one frame's assignments, returning the transitions it caused.
    /// Spots absent from `frame` are treated as not-detected.
    pub fn update(&mut self, frame: &FrameAssignments, timestamp: f64) -> Vec<TransitionEvent> {
        let mut events = Vec::new();

        for (spot_id, record) in self.records.iter_mut() {
            let seen = frame.spots.get(spot_id).filter(|a| a.occupied);

            match seen {
                Some(assignment) => {
                    record.miss_streak = 0;
                    record.confidence = assignment.confidence;
                    record.vehicle_class = assignment.vehicle_class;
                    if !record.occupied {
                        record.occupied = true;
                        record.since = timestamp;
                        events.push(TransitionEvent {
                            spot_id: spot_id.clone(),
                            transition: Transition::Occupied,
                            identity: record.identity.clone(),
                            timestamp,
                        });
                    }
                }
                None => {
                    if record.occupied {
                        record.miss_streak += 1;
                        if record.miss_streak > self.vacate_grace_frames {
                            let identity = record.identity.take();
                            if let Some(plate) = &identity {
                                push_history(
                                    &mut self.history,
                                    plate,
                                    ParkEvent::Vacated,
                                    spot_id,
                                    timestamp,
                                    record.confidence,
                                );
                            }
                            record.clear(timestamp);
                            events.push(TransitionEvent {
                                spot_id: spot_id.clone(),
                                transition: Transition::Vacated,
                                identity,
                                timestamp,
                            });
                        }
                    } else {
                        record.miss_streak = 0;
                    }
                }
            }
        }

        self.last_update = timestamp;
        for event in &events {
            debug!(
                "SPOT {} -> {:?} at t={:.2}",
                event.spot_id, event.transition, event.timestamp
            );
        }
        events
    }

    /// Explicit identity assignment (e.g. from a plate-reader webhook):
    /// the same overlap computation as the per-frame path, for a single
    /// box, committed immediately. Rejected below the minimum overlap,
    /// with the computed value reported for diagnostics.
    pub fn assign(
        &mut self,
        identity: &str,
        bbox: Rect,
        confidence: f32,
        timestamp: f64,
    ) -> AssignOutcome {
        if identity.trim().is_empty() {
            return AssignOutcome::rejected(None, 0., "invalid identity");
        }

        // Best spot: highest overlap ratio, centre distance as tiebreak
        let vehicle_center = bbox.center();
        let mut best: Option<(&SpotRegion, f32, f32)> = None;
        for region in &self.regions {
            let overlap = region.rect.overlap_ratio(&bbox);
            if overlap <= 0. {
                continue;
            }
            let dist = distance_points(&region.rect.center(), &vehicle_center);
            let better = match best {
                None => true,
                Some((_, best_overlap, best_dist)) => {
                    overlap > best_overlap || (overlap == best_overlap && dist < best_dist)
                }
            };
            if better {
                best = Some((region, overlap, dist));
            }
        }

        let Some((region, overlap, _)) = best else {
            return AssignOutcome::rejected(None, 0., "no suitable parking spot found");
        };
        let spot_id = region.id.clone();

        if overlap < self.assign_min_overlap {
            return AssignOutcome::rejected(
                Some(spot_id),
                overlap,
                format!(
                    "vehicle not clearly in a spot (overlap {:.0}%)",
                    overlap * 100.
                ),
            );
        }

        let identity = identity.trim().to_uppercase();

        // Evict this identity from any spot it previously occupied
        for (other_id, record) in self.records.iter_mut() {
            if *other_id == spot_id {
                continue;
            }
            if record.identity.as_deref() == Some(identity.as_str()) {
                info!("Evicting {} from spot {} (moved)", identity, other_id);
                push_history(
                    &mut self.history,
                    &identity,
                    ParkEvent::Vacated,
                    other_id,
                    timestamp,
                    record.confidence,
                );
                record.clear(timestamp);
            }
        }

        // Evict any different occupant of the target spot (last writer wins)
        if let Some(record) = self.records.get_mut(&spot_id) {
            if let Some(previous) = record.identity.take() {
                if previous != identity {
                    info!(
                        "Evicting {} from spot {} (replaced by {})",
                        previous, spot_id, identity
                    );
                    push_history(
                        &mut self.history,
                        &previous,
                        ParkEvent::Vacated,
                        &spot_id,
                        timestamp,
                        record.confidence,
                    );
                }
            }
            record.occupied = true;
            record.identity = Some(identity.clone());
            record.confidence = confidence;
            record.since = timestamp;
            record.miss_streak = 0;
        }

        push_history(
            &mut self.history,
            &identity,
            ParkEvent::Parked,
            &spot_id,
            timestamp,
            confidence,
        );
        self.last_update = timestamp;

        info!("Vehicle {} parked at spot {}", identity, spot_id);
        AssignOutcome {
            success: true,
            spot_id: Some(spot_id),
            overlap,
            reason: None,
        }
    }

    /// Where is this vehicle parked right now? Case-insensitive on the
    /// identity; O(spots), which is fine at this scale.
    pub fn find_identity(&self, identity: &str) -> Option<&str> {
        let wanted = identity.trim().to_uppercase();
        self.records.iter().find_map(|(spot_id, record)| {
            record
                .identity
                .as_deref()
                .filter(|id| id.eq_ignore_ascii_case(&wanted))
                .map(|_| spot_id.as_str())
        })
    }

    pub fn vehicle_history(&self, identity: &str) -> &[HistoryEvent] {
        self.history
            .get(&identity.trim().to_uppercase())
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    pub fn get_status(&self) -> LotStatus {
        let total_spots = self.records.len();
        let occupied_count = self.records.values().filter(|r| r.occupied).count();
        LotStatus {
            total_spots,
            occupied_count,
            available_count: total_spots - occupied_count,
            occupancy_rate: if total_spots > 0 {
                occupied_count as f32 / total_spots as f32
            } else {
                0.
            },
            spots: self
                .records
                .iter()
                .map(|(id, record)| SpotStatus {
                    id: id.clone(),
                    occupied: record.occupied,
                    identity: record.identity.clone(),
                    confidence: record.confidence,
                    vehicle_class: record.vehicle_class,
                    since: record.since,
                })
                .collect(),
            updated_at: self.last_update,
        }
    }

    pub fn regions(&self) -> &[SpotRegion] {
        &self.regions
    }
}

fn push_history(
    history: &mut IndexMap<String, Vec<HistoryEvent>>,
    identity: &str,
    event: ParkEvent,
    spot_id: &str,
    timestamp: f64,
    confidence: f32,
) {
    history
        .entry(identity.to_uppercase())
        .or_default()
        .push(HistoryEvent {
            event,
            spot_id: spot_id.to_string(),
            timestamp,
            confidence,
        });
}
