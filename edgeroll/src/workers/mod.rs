pub mod reports;
pub mod rollout;
pub mod updater;
