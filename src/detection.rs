use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::Point2D;
use crate::frame::Frame;
use crate::geometry::Rect;

/// Vehicle categories the tracker cares about; everything else the model
/// reports is discarded at the adapter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "car" => Some(VehicleClass::Car),
            "motorcycle" => Some(VehicleClass::Motorcycle),
            "bus" => Some(VehicleClass::Bus),
            "truck" => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    /// COCO class ids as reported by the usual detection models.
    pub fn from_coco_id(id: usize) -> Option<Self> {
        match id {
            2 => Some(VehicleClass::Car),
            3 => Some(VehicleClass::Motorcycle),
            5 => Some(VehicleClass::Bus),
            7 => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }
}

/// One raw observation from the external vision model: class label,
/// corner-format box in current-frame pixels, confidence in [0,1].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RawDetection {
    pub class: String,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// Normalized detection, vehicle classes only.
#[derive(Debug, Clone)]
pub struct Detection {
    pub class: VehicleClass,
    pub bbox: Rect,
    pub confidence: f32,
    pub center: Point2D,
    pub area: f32,
}

/// The narrow contract with the external vision model. The tracker does
/// not know or care how detection is implemented.
pub trait VehicleDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Normalizes raw model output into `Detection`s: drops non-vehicle
/// classes, sub-floor confidence, and degenerate boxes. Stateless per
/// frame.
#[derive(Debug, Clone)]
pub struct DetectionAdapter {
    confidence_floor: f32,
    allowed_classes: Vec<VehicleClass>,
}

impl DetectionAdapter {
    /// The floor is deliberately low (~0.05-0.15): a vehicle straddling a
    /// spot boundary often scores lower than a clean capture, and the
    /// aggressive filtering happens later at assignment time.
    pub fn new(confidence_floor: f32, allowed_classes: Option<Vec<VehicleClass>>) -> Self {
        DetectionAdapter {
            confidence_floor,
            allowed_classes: allowed_classes.unwrap_or_else(|| {
                vec![
                    VehicleClass::Car,
                    VehicleClass::Motorcycle,
                    VehicleClass::Bus,
                    VehicleClass::Truck,
                ]
            }),
        }
    }

    pub fn normalize(&self, raw: &[RawDetection]) -> Vec<Detection> {
        let mut detections = Vec::with_capacity(raw.len());
        for r in raw {
            let Some(class) = VehicleClass::from_label(&r.class) else {
                continue;
            };
            if !self.allowed_classes.contains(&class) {
                continue;
            }
            if r.confidence < self.confidence_floor {
                debug!(
                    "Dropping {} detection below confidence floor ({:.2} < {:.2})",
                    class.name(),
                    r.confidence,
                    self.confidence_floor
                );
                continue;
            }
            let bbox = Rect::from_corners(r.bbox);
            if bbox.is_degenerate() {
                continue;
            }
            detections.push(Detection {
                class,
                bbox,
                confidence: r.confidence,
                center: bbox.center(),
                area: bbox.area(),
            });
        }
        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class: &str, bbox: [f32; 4], confidence: f32) -> RawDetection {
        RawDetection {
            class: class.to_string(),
            bbox,
            confidence,
        }
    }

    #[test]
    fn test_non_vehicle_classes_discarded() {
        let adapter = DetectionAdapter::new(0.1, None);
        let out = adapter.normalize(&[
            raw("person", [0., 0., 10., 10.], 0.9),
            raw("car", [0., 0., 10., 10.], 0.9),
            raw("traffic light", [0., 0., 10., 10.], 0.9),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class, VehicleClass::Car);
    }

    #[test]
    fn test_confidence_floor() {
        let adapter = DetectionAdapter::new(0.1, None);
        let out = adapter.normalize(&[
            raw("car", [0., 0., 10., 10.], 0.05),
            raw("truck", [0., 0., 10., 10.], 0.1),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class, VehicleClass::Truck);
    }

    #[test]
    fn test_degenerate_boxes_dropped() {
        let adapter = DetectionAdapter::new(0.1, None);
        let out = adapter.normalize(&[raw("car", [10., 10., 10., 20.], 0.9)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_center_and_area_derived() {
        let adapter = DetectionAdapter::new(0.1, None);
        let out = adapter.normalize(&[raw("bus", [0., 0., 100., 50.], 0.8)]);
        assert_eq!(out[0].center, (50., 25.));
        assert_eq!(out[0].area, 5000.);
    }

    #[test]
    fn test_custom_allow_list() {
        let adapter = DetectionAdapter::new(0.1, Some(vec![VehicleClass::Car]));
        let out = adapter.normalize(&[
            raw("car", [0., 0., 10., 10.], 0.9),
            raw("truck", [0., 0., 10., 10.], 0.9),
        ]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_coco_id_mapping() {
        assert_eq!(VehicleClass::from_coco_id(2), Some(VehicleClass::Car));
        assert_eq!(VehicleClass::from_coco_id(7), Some(VehicleClass::Truck));
        assert_eq!(VehicleClass::from_coco_id(0), None);
    }
}
