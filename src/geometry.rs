use serde::{Deserialize, Serialize};

use crate::Point2D;

/// Axis-aligned rectangle in pixel coordinates, corner format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Rect { x1, y1, x2, y2 }
    }

    pub fn from_anchor_size(anchor: Point2D, width: f32, height: f32) -> Self {
        let (x, y) = anchor;
        Rect {
            x1: x,
            y1: y,
            x2: x + width,
            y2: y + height,
        }
    }

    pub fn from_corners(corners: [f32; 4]) -> Self {
        let [x1, y1, x2, y2] = corners;
        Rect { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        (self.width().max(0.)) * (self.height().max(0.))
    }

    pub fn center(&self) -> Point2D {
        ((self.x1 + self.x2) / 2., (self.y1 + self.y2) / 2.)
    }

    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// The overlapping region between two rectangles, or None if they
    /// do not intersect.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x_left = self.x1.max(other.x1);
        let y_top = self.y1.max(other.y1);
        let x_right = self.x2.min(other.x2);
        let y_bottom = self.y2.min(other.y2);

        if x_right > x_left && y_bottom > y_top {
            Some(Rect::new(x_left, y_top, x_right, y_bottom))
        } else {
            None
        }
    }

    /// Intersection area divided by *this* rectangle's area. Note this is
    /// not IoU: the denominator is the spot area, not the union, so a
    /// vehicle fully covering a spot always scores 1.0 regardless of how
    /// much it spills over.
    pub fn overlap_ratio(&self, other: &Rect) -> f32 {
        let own_area = self.area();
        if own_area <= 0. {
            return 0.;
        }
        match self.intersection(other) {
            Some(overlap) => overlap.area() / own_area,
            None => 0.,
        }
    }
}

pub fn distance(x1: f32, y1: f32, x2: f32, y2: f32) -> f32 {
    ((x2 - x1).powf(2.0) + (y2 - y1).powf(2.0)).sqrt()
}

pub fn distance_points(a: &Point2D, b: &Point2D) -> f32 {
    let (x1, y1) = *a;
    let (x2, y2) = *b;

    f32::sqrt(f32::powi(x1 - x2, 2) + f32::powi(y1 - y2, 2))
}
