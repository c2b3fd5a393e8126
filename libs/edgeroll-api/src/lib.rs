//! Request and response models of the edgeroll API

pub mod models;

pub use models::*;
