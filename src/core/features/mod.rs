pub mod detector;
pub mod keypoint;

pub use detector::FeatureDetector;
pub use keypoint::{EnhancementMethod, FeatureSet, Keypoint, DESCRIPTOR_DIM, MIN_FEATURES};
