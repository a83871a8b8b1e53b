pub mod camera;
pub mod config;
pub mod convention;
pub mod dataset;
pub mod estimator;
pub mod triangulation;
pub mod video;
