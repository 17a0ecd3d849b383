pub mod classifier;
pub mod events;
pub mod gateway;
pub mod jobs;
pub mod ledger;
pub mod queue;
pub mod scheduler;
pub mod worker;
