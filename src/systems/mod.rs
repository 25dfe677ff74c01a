pub mod adaptive;
pub mod assignment;
pub mod occupancy;
pub mod strategy;
