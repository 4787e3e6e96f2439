// ledger/src/lib.rs
pub mod account;
pub mod adapters;
pub mod balance;
pub mod entry;
pub mod error;
pub mod plan;
pub mod record;
pub mod transaction;

pub use account::AccountType;
pub use adapters::MemoryAdapter;
#[cfg(feature = "postgres")]
pub use adapters::PostgresAdapter;
pub use balance::{Balance, BalanceKey};
pub use entry::{EntryFilter, EntryType, LedgerEntry, Reference, ReferenceType, idempotency_key};
pub use error::LedgerError;
pub use plan::{ExecutionPlan, Operation, PlanReceipt};
pub use record::{Expect, ObjectRecord, RecordQuery, unique_key_hash};
pub use transaction::{Ledger, LedgerContext, TransactionContext};

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Storage backend for balances, entries and domain records.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Execute the complete operation plan atomically.
    /// Implementors MUST:
    /// 1. BEGIN a transaction
    /// 2. Lock every row in `plan.balance_keys()`, in that order
    /// 3. Apply operations in plan order, failing on the first violated
    ///    precondition (`InsufficientFunds`, `Conflict`, `GuardFailed`)
    /// 4. COMMIT on success, ROLLBACK on any error
    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<PlanReceipt, LedgerError>;

    // READ OPERATIONS
    /// Zero balance if the row was never touched.
    async fn get_balance(&self, key: &BalanceKey) -> Result<Balance, LedgerError>;
    async fn get_balances(
        &self,
        user_id: Uuid,
        account_type: Option<AccountType>,
    ) -> Result<Vec<Balance>, LedgerError>;
    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<LedgerEntry>, LedgerError>;
    async fn get_record(&self, kind: &str, id: &str)
    -> Result<Option<ObjectRecord>, LedgerError>;
    async fn find_record_by_key(
        &self,
        kind: &str,
        key: &str,
    ) -> Result<Option<ObjectRecord>, LedgerError>;
    /// Newest first.
    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ObjectRecord>, LedgerError>;
}

/// Initialize the ledger system with an adapter
pub struct LedgerSystem {
    adapter: Arc<dyn LedgerAdapter>,
}

impl LedgerSystem {
    pub fn new(adapter: Box<dyn LedgerAdapter>) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    pub fn from_arc(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    pub fn adapter_arc(&self) -> Arc<dyn LedgerAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn context(&self) -> LedgerContext {
        LedgerContext::new(self.adapter_arc())
    }
}
