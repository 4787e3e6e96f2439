// ledger/src/adapters/postgres.rs
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::{apply_credit, apply_debit, apply_lock, apply_set, apply_unlock};
use crate::{
    AccountType, Balance, BalanceKey, EntryFilter, EntryType, ExecutionPlan, Expect,
    LedgerAdapter, LedgerEntry, LedgerError, ObjectRecord, Operation, PlanReceipt, RecordQuery,
};

/// PostgreSQL adapter.
///
/// Schema:
/// ```sql
/// CREATE TABLE ledger_balances (
///     user_id uuid NOT NULL,
///     asset TEXT NOT NULL,
///     account_type TEXT NOT NULL,
///     available NUMERIC NOT NULL DEFAULT 0 CHECK (available >= 0),
///     locked NUMERIC NOT NULL DEFAULT 0 CHECK (locked >= 0),
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     PRIMARY KEY (user_id, asset, account_type)
/// );
/// -- append-only, enforced by trigger
/// CREATE TABLE ledger_entries (...);
/// -- one deposit credit per (user, asset, tx hash)
/// CREATE UNIQUE INDEX idx_ledger_entries_deposit_once ON ledger_entries(user_id, asset, reference_id)
///     WHERE entry_type = 'deposit_credit' AND reference_type = 'deposit';
/// CREATE TABLE ledger_records (kind, id, owner, status, partition, data JSONB, ...);
/// CREATE TABLE ledger_record_keys (key TEXT PRIMARY KEY, kind, id);
/// ```
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the database schema. Idempotent.
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS ledger_balances (
                user_id UUID NOT NULL,
                asset TEXT NOT NULL,
                account_type TEXT NOT NULL,
                available NUMERIC NOT NULL DEFAULT 0 CHECK (available >= 0),
                locked NUMERIC NOT NULL DEFAULT 0 CHECK (locked >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (user_id, asset, account_type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                asset TEXT NOT NULL,
                account_type TEXT NOT NULL,
                amount NUMERIC NOT NULL,
                entry_type TEXT NOT NULL,
                reference_type TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT 'null'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_user
                ON ledger_entries(user_id, created_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_reference
                ON ledger_entries(reference_type, reference_id)
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entries_deposit_once
                ON ledger_entries(user_id, asset, reference_id)
                WHERE entry_type = 'deposit_credit' AND reference_type = 'deposit'
            "#,
            r#"
            CREATE OR REPLACE FUNCTION ledger_entries_immutable() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'ledger_entries is append-only';
            END;
            $$ LANGUAGE plpgsql
            "#,
            r#"
            DROP TRIGGER IF EXISTS trg_ledger_entries_immutable ON ledger_entries
            "#,
            r#"
            CREATE TRIGGER trg_ledger_entries_immutable
                BEFORE UPDATE OR DELETE ON ledger_entries
                FOR EACH ROW EXECUTE FUNCTION ledger_entries_immutable()
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ledger_records (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                owner UUID NOT NULL,
                status TEXT NOT NULL,
                partition TEXT NOT NULL,
                data JSONB NOT NULL,
                unique_keys TEXT[] NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_records_owner
                ON ledger_records(kind, owner, created_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_records_status
                ON ledger_records(kind, status, partition)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ledger_record_keys (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                FOREIGN KEY (kind, id) REFERENCES ledger_records(kind, id)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn lock_balance(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        key: &BalanceKey,
    ) -> Result<Balance, LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_balances (user_id, asset, account_type)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.user_id)
        .bind(&key.asset)
        .bind(key.account_type.as_str())
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT user_id, asset, account_type, available, locked, updated_at
            FROM ledger_balances
            WHERE user_id = $1 AND asset = $2 AND account_type = $3
            FOR UPDATE
            "#,
        )
        .bind(key.user_id)
        .bind(&key.asset)
        .bind(key.account_type.as_str())
        .fetch_one(&mut **tx)
        .await?;

        balance_from_row(&row)
    }

    async fn append_entry(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, user_id, asset, account_type, amount, entry_type,
                 reference_type, reference_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(&entry.asset)
        .bind(entry.account_type.as_str())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.reference_type.as_str())
        .bind(&entry.reference_id)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn deposit_credited(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        entry: &LedgerEntry,
    ) -> Result<bool, LedgerError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_entries
                WHERE user_id = $1 AND asset = $2
                  AND reference_type = $3 AND reference_id = $4
                  AND entry_type = 'deposit_credit'
            )
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.asset)
        .bind(entry.reference_type.as_str())
        .bind(&entry.reference_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    async fn put_record(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        record: &ObjectRecord,
        expect: &Expect,
    ) -> Result<(), LedgerError> {
        match expect {
            Expect::Absent => {
                sqlx::query(
                    r#"
                    INSERT INTO ledger_records
                        (kind, id, owner, status, partition, data, unique_keys, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(&record.kind)
                .bind(&record.id)
                .bind(record.owner)
                .bind(&record.status)
                .bind(&record.partition)
                .bind(&record.data)
                .bind(&record.unique_keys)
                .bind(record.created_at)
                .bind(record.updated_at)
                .execute(&mut **tx)
                .await?;

                let hashes = record.hashed_keys();
                if !hashes.is_empty() {
                    sqlx::query(
                        r#"
                        INSERT INTO ledger_record_keys (key, kind, id)
                        SELECT unnest($1::text[]), $2, $3
                        "#,
                    )
                    .bind(&hashes)
                    .bind(&record.kind)
                    .bind(&record.id)
                    .execute(&mut **tx)
                    .await?;
                }
            }
            Expect::Status(prior) => {
                let result = sqlx::query(
                    r#"
                    UPDATE ledger_records
                    SET owner = $3, status = $4, partition = $5, data = $6, updated_at = NOW()
                    WHERE kind = $1 AND id = $2 AND status = $7
                    "#,
                )
                .bind(&record.kind)
                .bind(&record.id)
                .bind(record.owner)
                .bind(&record.status)
                .bind(&record.partition)
                .bind(&record.data)
                .bind(prior)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(LedgerError::GuardFailed {
                        kind: record.kind.clone(),
                        id: record.id.clone(),
                        expected: prior.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T, LedgerError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(LedgerError::Corrupt)
}

fn balance_from_row(row: &PgRow) -> Result<Balance, LedgerError> {
    Ok(Balance {
        user_id: row.try_get("user_id")?,
        asset: row.try_get("asset")?,
        account_type: parse_column(row, "account_type")?,
        available: row.try_get("available")?,
        locked: row.try_get("locked")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        asset: row.try_get("asset")?,
        account_type: parse_column(row, "account_type")?,
        amount: row.try_get("amount")?,
        entry_type: parse_column(row, "entry_type")?,
        reference_type: parse_column(row, "reference_type")?,
        reference_id: row.try_get("reference_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<ObjectRecord, LedgerError> {
    Ok(ObjectRecord {
        kind: row.try_get("kind")?,
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        status: row.try_get("status")?,
        partition: row.try_get("partition")?,
        data: row.try_get("data")?,
        unique_keys: row.try_get("unique_keys")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const RECORD_COLUMNS: &str =
    "kind, id, owner, status, partition, data, unique_keys, created_at, updated_at";

#[async_trait]
impl LedgerAdapter for PostgresAdapter {
    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<PlanReceipt, LedgerError> {
        plan.validate()?;

        let mut tx = self.pool.begin().await?;

        // ── Phase 1: Lock balance rows in key order ───────────────────────────
        let mut balances: BTreeMap<BalanceKey, Balance> = BTreeMap::new();
        for key in plan.balance_keys() {
            let row = Self::lock_balance(&mut tx, &key).await?;
            balances.insert(key, row);
        }

        // ── Phase 2: Apply operations ─────────────────────────────────────────
        let mut receipt = PlanReceipt::default();
        let mut credited_here: HashSet<String> = HashSet::new();

        for op in plan.operations() {
            match op {
                Operation::Credit { key, amount } => {
                    apply_credit(locked_row(&mut balances, key)?, *amount)?;
                }
                Operation::Debit { key, amount } => {
                    apply_debit(locked_row(&mut balances, key)?, *amount)?;
                }
                Operation::Lock { key, amount } => {
                    apply_lock(locked_row(&mut balances, key)?, *amount)?;
                }
                Operation::Unlock { key, amount } => {
                    if let Some(shortfall) = apply_unlock(locked_row(&mut balances, key)?, *amount)? {
                        receipt.over_unlocks.push((key.clone(), shortfall));
                    }
                }
                Operation::SetBalance {
                    key,
                    prior_available,
                    prior_locked,
                    available,
                    locked,
                } => {
                    apply_set(
                        locked_row(&mut balances, key)?,
                        key,
                        (*prior_available, *prior_locked),
                        (*available, *locked),
                    )?;
                }
                Operation::Append { entry } => {
                    if entry.entry_type == EntryType::DepositCredit {
                        credited_here.insert(entry.idempotency_key());
                    }
                    Self::append_entry(&mut tx, entry).await?;
                }
                Operation::CreditOnce { key, entry } => {
                    let idem = entry.idempotency_key();
                    if credited_here.contains(&idem) || Self::deposit_credited(&mut tx, entry).await? {
                        receipt.skipped_credits.push(entry.reference_id.clone());
                        continue;
                    }
                    apply_credit(locked_row(&mut balances, key)?, entry.amount)?;
                    Self::append_entry(&mut tx, entry).await?;
                    credited_here.insert(idem);
                }
                Operation::PutRecord { record, expect } => {
                    Self::put_record(&mut tx, record, expect).await?;
                }
            }
        }

        // ── Phase 3: Write back balance rows ──────────────────────────────────
        for (key, balance) in &balances {
            sqlx::query(
                r#"
                UPDATE ledger_balances
                SET available = $4, locked = $5, updated_at = NOW()
                WHERE user_id = $1 AND asset = $2 AND account_type = $3
                "#,
            )
            .bind(key.user_id)
            .bind(&key.asset)
            .bind(key.account_type.as_str())
            .bind(balance.available)
            .bind(balance.locked)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(receipt)
    }

    async fn get_balance(&self, key: &BalanceKey) -> Result<Balance, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, asset, account_type, available, locked, updated_at
            FROM ledger_balances
            WHERE user_id = $1 AND asset = $2 AND account_type = $3
            "#,
        )
        .bind(key.user_id)
        .bind(&key.asset)
        .bind(key.account_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => balance_from_row(&row),
            None => Ok(Balance::zero(key)),
        }
    }

    async fn get_balances(
        &self,
        user_id: Uuid,
        account_type: Option<AccountType>,
    ) -> Result<Vec<Balance>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, asset, account_type, available, locked, updated_at
            FROM ledger_balances
            WHERE user_id = $1 AND ($2::text IS NULL OR account_type = $2)
            ORDER BY asset, account_type
            "#,
        )
        .bind(user_id)
        .bind(account_type.map(|a| a.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let mut balances = rows
            .iter()
            .map(balance_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        balances.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(balances)
    }

    async fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, user_id, asset, account_type, amount, entry_type, reference_type, \
             reference_id, metadata, created_at FROM ledger_entries WHERE TRUE",
        );
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(asset) = &filter.asset {
            qb.push(" AND asset = ").push_bind(asset.clone());
        }
        if let Some(entry_type) = filter.entry_type {
            qb.push(" AND entry_type = ").push_bind(entry_type.as_str());
        }
        if let Some(reference_type) = filter.reference_type {
            qb.push(" AND reference_type = ")
                .push_bind(reference_type.as_str());
        }
        if let Some(reference_id) = &filter.reference_id {
            qb.push(" AND reference_id = ").push_bind(reference_id.clone());
        }
        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn get_record(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Option<ObjectRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM ledger_records WHERE kind = $1 AND id = $2"
        ))
        .bind(kind)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_record_by_key(
        &self,
        kind: &str,
        key: &str,
    ) -> Result<Option<ObjectRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT r.{} FROM ledger_record_keys k \
             JOIN ledger_records r ON r.kind = k.kind AND r.id = k.id \
             WHERE k.key = $1",
            RECORD_COLUMNS.replace(", ", ", r.")
        ))
        .bind(crate::unique_key_hash(kind, key))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<ObjectRecord>, LedgerError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {RECORD_COLUMNS} FROM ledger_records WHERE kind = "
        ));
        qb.push_bind(query.kind.clone());
        if let Some(owner) = query.owner {
            qb.push(" AND owner = ").push_bind(owner);
        }
        if let Some(status) = &query.status {
            qb.push(" AND status = ").push_bind(status.clone());
        }
        if let Some(partition) = &query.partition {
            qb.push(" AND partition = ").push_bind(partition.clone());
        }
        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}

fn locked_row<'a>(
    balances: &'a mut BTreeMap<BalanceKey, Balance>,
    key: &BalanceKey,
) -> Result<&'a mut Balance, LedgerError> {
    balances
        .get_mut(key)
        .ok_or_else(|| LedgerError::Storage(format!("balance row not locked: {key:?}")))
}
