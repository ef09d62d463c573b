//! Geometry utilities: rigid poses, Sim3 transforms, trajectory alignment.

pub mod alignment;
pub mod pose;
pub mod sim3;

pub use alignment::align_points;
pub use sim3::Sim3;
