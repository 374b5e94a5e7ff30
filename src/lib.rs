pub mod acquire;
pub mod analyzers;
pub mod app;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod index;
pub mod output;
pub mod parallel;
pub mod progress;
pub mod scan;
pub mod store;
