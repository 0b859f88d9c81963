pub mod audit;
pub mod claim;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod orchestrator;
pub mod stage;
pub mod store;
pub mod worker_config;
