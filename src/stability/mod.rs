//! Lifecycle coordination shared by engines, routers and reconnectors

pub mod graceful_shutdown;

pub use graceful_shutdown::ShutdownSignal;
