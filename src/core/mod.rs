pub mod chemistry;
pub mod config;
pub mod domain;
pub mod spatial;
