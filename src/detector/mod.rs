pub mod classifier;
pub mod movement;

pub use movement::{Detection, MovementDetector};
