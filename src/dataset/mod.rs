pub mod bottom_up;
pub mod pipeline;
pub mod scene;
pub mod visualize;

pub use bottom_up::{BottomUpMviewMpersonDataset, FrameSample};
pub use pipeline::{ImageOp, ImagePipeline};
pub use scene::Scene;
