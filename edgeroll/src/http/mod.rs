pub mod client;
pub mod reports;
pub mod updates;
