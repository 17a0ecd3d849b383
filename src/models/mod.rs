pub mod job;
pub mod transaction;
