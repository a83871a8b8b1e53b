pub mod crop;
pub mod preprocess;
pub mod top_down;

pub use crop::{crop_bbox, rescale_landmarks, BboxXyxy};
pub use preprocess::preprocess_for_landmark;
pub use top_down::TopDownEstimator;
