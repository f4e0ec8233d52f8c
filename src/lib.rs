pub mod algorithms;
pub mod core;
pub mod engine;
pub mod workflow;
