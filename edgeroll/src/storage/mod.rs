pub mod layout;
pub mod memory;
pub mod repository;
pub mod settings;
