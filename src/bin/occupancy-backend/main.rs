use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{debug, info};
use serde::Deserialize;

use parking_occupancy_consolidation::detection::{
    DetectionAdapter, RawDetection, VehicleDetector,
};
use parking_occupancy_consolidation::frame::Frame;
use parking_occupancy_consolidation::lot_config::load_config_from_file;
use parking_occupancy_consolidation::session::{FrameSource, TrackingSession, build_spot_regions};
use parking_occupancy_consolidation::systems::assignment::SpotAssignmentEngine;
use parking_occupancy_consolidation::systems::occupancy::OccupancyTracker;
use parking_occupancy_consolidation::systems::strategy::ModelOverlapStrategy;

mod cli;
use cli::Cli;

/// One replayed frame: its dimensions, timestamp and whatever the vision
/// model reported for it.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct ReplayRecord {
    width: u32,
    height: u32,
    timestamp: f64,
    detections: Vec<RawDetection>,
}

/// Feeds the recorded detections back, one frame per `detect` call, in
/// lockstep with `ReplaySource`.
struct ScriptedDetector {
    frames: VecDeque<Vec<RawDetection>>,
}

impl VehicleDetector for ScriptedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        Ok(self.frames.pop_front().unwrap_or_default())
    }
}

/// Yields dimension-only frames matching the replay log; there is no pixel
/// data in a detection replay.
struct ReplaySource {
    frames: VecDeque<(u32, u32, f64)>,
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self
            .frames
            .pop_front()
            .map(|(width, height, timestamp)| Frame::dimensions_only(width, height, timestamp)))
    }
}

fn load_replay(path: &str) -> Result<Vec<ReplayRecord>> {
    let file =
        File::open(path).with_context(|| format!("failed to open detection replay \"{}\"", path))?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = serde_json::from_str(&line)
            .with_context(|| format!("bad replay record on line {}", index + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger from the environment

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();

    debug!("Started; args: {:?}", cli);

    let config = load_config_from_file(&cli.config_path)?;
    let records = load_replay(&cli.detections_path)?;
    info!(
        "Replaying {} frame records over {} spots",
        records.len(),
        config.spots().len()
    );

    let frame_dimensions = records.first().map(|r| (r.width, r.height));
    let regions = build_spot_regions(&config, frame_dimensions)?;

    let mut detections = VecDeque::with_capacity(records.len());
    let mut frames = VecDeque::with_capacity(records.len());
    for record in records {
        detections.push_back(record.detections);
        frames.push_back((record.width, record.height, record.timestamp));
    }

    let strategy = ModelOverlapStrategy::new(
        Box::new(ScriptedDetector { frames: detections }),
        DetectionAdapter::new(config.detection_confidence_floor, None),
        SpotAssignmentEngine::new(regions.clone(), config.overlap_accept_threshold),
    );
    let tracker = OccupancyTracker::new(
        regions,
        config.assign_min_overlap,
        config.vacate_grace_frames,
    )?;
    let mut session = TrackingSession::new(Box::new(strategy), tracker);

    let mut source = ReplaySource { frames };
    session.run(&mut source, |event| {
        if !cli.status_only {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        }
    })?;

    println!("{}", serde_json::to_string_pretty(&session.status())?);
    Ok(())
}
