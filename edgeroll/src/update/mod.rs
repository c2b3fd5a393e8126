pub mod executor;
pub mod fetcher;
pub mod health;
pub mod reporter;
pub mod rollback;
pub mod scripts;
pub mod source;
pub mod verify;
