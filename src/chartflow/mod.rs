// SPDX-License-Identifier: MIT

//! Application layer: configuration, payload loading and the built-in
//! chat-to-chart pipeline

pub mod config;
pub mod loader;
pub mod nodes;

pub use config::AppConfig;
pub use loader::StateLoader;
pub use nodes::{default_pipeline, flaky_pipeline, ChartNode, FlakyNode, IntentNode, SqlDraftNode};
