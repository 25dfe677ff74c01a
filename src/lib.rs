pub mod calibration;
pub mod detection;
pub mod foreground;
pub mod frame;
pub mod geometry;
pub mod lot_config;
pub mod session;
pub mod systems;

pub type Point2D = (f32, f32);
