pub mod batch;
pub mod classify;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod outbox;
pub mod planner;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod sync_import;
pub mod validate;
pub mod worker;
