use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::transaction::TransactionStatus;

/// Failure reported by a ledger call, reduced to the tags the retry
/// classifier understands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The call exceeded its deadline; the outcome is unknown.
    #[error("Ledger call timed out: {0}")]
    Timeout(String),

    #[error("Ledger endpoint unavailable: {0}")]
    Unavailable(String),

    /// The in-flight invocation can no longer be used (stale proposal,
    /// read conflict, invocation id clash).
    #[error("Invocation no longer valid: {0}")]
    InvalidInvocation(String),

    /// The ledger already holds a transaction under this invocation id.
    #[error("Invocation already applied: {0}")]
    AlreadyApplied(String),

    /// Contract logic, argument or authorization rejection.
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Unexpected ledger failure: {0}")]
    Unknown(String),
}

/// One attempt at applying a write, identified by an invocation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub id: String,
    /// Opaque checkpoint from which the same invocation can be resumed.
    pub checkpoint: Vec<u8>,
}

/// Client for one tenant's view of the ledger network.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Prepare a fresh invocation of `operation`.
    fn begin(&self, operation: &str, args: &[String]) -> Result<Invocation, LedgerError>;

    /// Rebuild an invocation from a checkpoint produced by [`Ledger::begin`].
    fn resume(&self, checkpoint: &[u8]) -> Result<Invocation, LedgerError>;

    /// Endorse, order and wait for commit of `invocation`. Returns the
    /// contract result.
    async fn submit(
        &self,
        invocation: &Invocation,
        operation: &str,
        args: &[String],
    ) -> Result<Vec<u8>, LedgerError>;

    /// Run `operation` against a single peer without ordering it.
    async fn evaluate(&self, operation: &str, args: &[String]) -> Result<Vec<u8>, LedgerError>;

    /// Commit status of a transaction submitted under `invocation_id`.
    async fn transaction_status(&self, invocation_id: &str) -> Result<TransactionStatus, LedgerError>;

    /// Whether the ledger refuses to apply the same invocation id twice.
    fn exactly_once(&self) -> bool;
}

/// Tenant id to ledger client lookup.
#[derive(Clone, Default)]
pub struct LedgerRegistry {
    ledgers: HashMap<String, Arc<dyn Ledger>>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tenant_id: impl Into<String>, ledger: Arc<dyn Ledger>) -> Self {
        self.insert(tenant_id, ledger);
        self
    }

    pub fn insert(&mut self, tenant_id: impl Into<String>, ledger: Arc<dyn Ledger>) {
        self.ledgers.insert(tenant_id.into(), ledger);
    }

    pub fn resolve(&self, tenant_id: &str) -> Option<Arc<dyn Ledger>> {
        self.ledgers.get(tenant_id).cloned()
    }

    pub fn tenants(&self) -> impl Iterator<Item = &str> {
        self.ledgers.keys().map(String::as_str)
    }
}
