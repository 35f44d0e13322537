//! Shared fixtures for unit and integration tests.

mod cluster;
mod loopback;

pub use cluster::{TestClient, TestCluster, TestClusterOptions};
pub use loopback::LoopbackConnector;
