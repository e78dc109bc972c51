pub mod config;
pub mod db;
pub mod lease;
pub mod matchmaker;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod traffic;
pub mod ws;
