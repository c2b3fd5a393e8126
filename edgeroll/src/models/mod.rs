pub mod campaign;
pub mod deployment;
pub mod device;
pub mod manifest;
pub mod strategy;
pub mod update;
