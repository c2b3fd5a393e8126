pub mod client;
pub mod directory;
pub mod fsm;
pub mod orchestrator;
pub mod strategy;
