// Shared components
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod types;

// Schema feed and storage
pub mod schema;
pub mod storage;

// Message delivery
pub mod messager;

// Admin surface
pub mod api;
pub mod server;
