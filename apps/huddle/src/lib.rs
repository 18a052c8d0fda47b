pub mod backoff;
pub mod config;
pub mod loopback;
pub mod media;
pub mod monitor;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod simulate;
pub mod telemetry;
