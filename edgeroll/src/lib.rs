//! edgeroll Library
//!
//! Deployment orchestration for edge fleets: strategy-driven rollouts on the
//! control side and a transactional update executor on the device side.

pub mod api;
pub mod app;
pub mod bus;
pub mod campaign;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod rollout;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod update;
pub mod utils;
pub mod workers;
