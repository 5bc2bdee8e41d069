pub mod config;
pub mod db;
pub mod digest;
pub mod ingest;
pub mod labels;
pub mod location;
pub mod visits;

/// Application name for XDG paths
pub const APP_NAME: &str = "fieldvisits";
