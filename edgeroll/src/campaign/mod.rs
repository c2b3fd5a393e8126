pub mod adapter;
pub mod artifacts;
pub mod service;
