use chrono::{DateTime, Utc};
use ledger::{LedgerError, ObjectRecord};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::Error;

/// A domain type persisted as an [`ObjectRecord`].
///
/// `owner`, `status` and `partition` are copied out of the body so the store
/// can filter and guard transitions on them.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn record_id(&self) -> String;
    fn owner(&self) -> Uuid;
    fn status(&self) -> String;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;

    fn partition(&self) -> String {
        String::new()
    }

    /// Secondary keys that must be unique among records of this kind.
    fn unique_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn to_record(&self) -> Result<ObjectRecord, Error> {
        let data = serde_json::to_value(self)
            .map_err(|e| Error::Store(LedgerError::Corrupt(e.to_string())))?;
        Ok(ObjectRecord {
            kind: Self::KIND.to_string(),
            id: self.record_id(),
            owner: self.owner(),
            status: self.status(),
            partition: self.partition(),
            data,
            unique_keys: self.unique_keys(),
            created_at: self.created_at(),
            updated_at: self.updated_at(),
        })
    }

    fn from_record(record: ObjectRecord) -> Result<Self, Error> {
        if record.kind != Self::KIND {
            return Err(Error::Store(LedgerError::Corrupt(format!(
                "expected {} record, got {}",
                Self::KIND,
                record.kind
            ))));
        }
        serde_json::from_value(record.data).map_err(|e| {
            Error::Store(LedgerError::Corrupt(format!(
                "{} {}: {}",
                Self::KIND,
                record.id,
                e
            )))
        })
    }
}
