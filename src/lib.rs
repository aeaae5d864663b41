pub mod analysis;
pub mod batch;
pub mod canon;
pub mod config;
pub mod driver;
pub mod graph;
pub mod neighbors;
pub mod session;

#[cfg(test)]
mod testutil;

/// Application name for XDG paths
pub const APP_NAME: &str = "beatwalk";
