pub mod app;
pub mod config;
pub mod container;
pub mod domain;
pub mod error;
pub mod extract;
pub mod formats;
pub mod fs_util;
pub mod materialize;
pub mod orchestrator;
pub mod output;
pub mod resolver;
pub mod store;
pub mod transport;
