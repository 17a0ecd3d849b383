//! Ledger REST Queue
//!
//! REST facade over a permissioned ledger network. Writes are deferred to a
//! persisted job queue whose worker submits them with classified retries;
//! callers poll job state instead of waiting on ledger finality.

pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod runtime;
pub mod services;
