#![forbid(unsafe_code)]

pub mod analyzer;
pub mod cache;
pub mod command;
pub mod controller;
pub mod display;
pub mod irc;
pub mod keys;
pub mod ranking;
pub mod telemetry;

/// Product name used in banners and log lines.
pub const PRODUCT_NAME: &str = "Matrix Relay";

/// Crate version reported by `--version` and the command banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
