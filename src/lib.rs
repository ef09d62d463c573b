pub mod config;
pub mod context;
pub mod dataset;
pub mod events;
pub mod experiment;
pub mod frontend;
pub mod geometry;
pub mod metrics;
pub mod model;
pub mod storage;
pub mod tasks;
