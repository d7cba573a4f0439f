pub mod client;
pub mod config;
pub mod proctor;
pub mod session;
pub mod storage;
pub mod sync;
pub mod telemetry;
