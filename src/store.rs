//! sled-backed record store.
//!
//! Every record lives in the default tree under a `table/{id:020}` key and is
//! encoded with minicbor. Multi-record mutations go through
//! [`Store::transaction`]; helpers that mutate take an open [`Tx`] so they can
//! be composed inside a caller's transaction without committing on their own.
use crate::error::PricingError;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::sync::Arc;

pub type TxResult<T> = ConflictableTransactionResult<T, PricingError>;

/// Abort the surrounding transaction with `err`.
pub fn abort<T>(err: PricingError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

/// Carry a non-transactional result into a transaction, aborting on error.
pub fn lift<T>(result: Result<T, PricingError>) -> TxResult<T> {
    result.map_err(ConflictableTransactionError::Abort)
}

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn db(&self) -> &Arc<sled::Db> {
        &self.instance
    }

    pub fn get<T>(&self, key: &str) -> Result<Option<T>, PricingError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.instance.get(key.as_bytes())? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// All records under `prefix`, in key order.
    pub fn scan<T>(&self, prefix: &str) -> Result<Vec<T>, PricingError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let mut records = Vec::new();
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = entry?;
            records.push(decode(&String::from_utf8_lossy(&key), &bytes)?);
        }
        Ok(records)
    }

    /// Keys under `prefix`, in order.
    pub fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, PricingError> {
        self.instance
            .scan_prefix(prefix.as_bytes())
            .keys()
            .map(|key| Ok(String::from_utf8_lossy(&key?).into_owned()))
            .collect()
    }

    /// Run `f` in a transaction. The closure may be retried on conflict, so it
    /// must only touch state through `Tx`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, PricingError>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        self.instance
            .transaction(|tree| f(&Tx { tree }))
            .map_err(|err| match err {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => PricingError::Persistence(e),
            })
    }
}

/// Handle to an open transaction.
pub struct Tx<'a> {
    tree: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn get<T>(&self, key: &str) -> TxResult<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => match decode(key, &bytes) {
                Ok(record) => Ok(Some(record)),
                Err(e) => abort(e),
            },
            None => Ok(None),
        }
    }

    /// Fetch a record that must exist.
    pub fn require<T>(&self, key: &str, entity: &'static str, id: u64) -> TxResult<T>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.get(key)? {
            Some(record) => Ok(record),
            None => abort(PricingError::NotFound { entity, id }),
        }
    }

    pub fn put<T>(&self, key: &str, record: &T) -> TxResult<()>
    where
        T: minicbor::Encode<()>,
    {
        let bytes = match encode(record) {
            Ok(bytes) => bytes,
            Err(e) => return abort(e),
        };
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> TxResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn next_id(&self) -> TxResult<u64> {
        // ids start at 1 so that 0 never names a row
        self.tree
            .generate_id()
            .map(|id| id + 1)
            .map_err(ConflictableTransactionError::Storage)
    }
}

pub fn encode<T>(record: &T) -> Result<Vec<u8>, PricingError>
where
    T: minicbor::Encode<()>,
{
    minicbor::to_vec(record).map_err(|e| PricingError::Encode(e.to_string()))
}

fn decode<T>(key: &str, bytes: &[u8]) -> Result<T, PricingError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|source| PricingError::Decode {
        key: key.to_string(),
        source,
    })
}

pub mod keys {
    pub fn package(id: u64) -> String {
        format!("package/{id:020}")
    }
    pub fn pricing(id: u64) -> String {
        format!("pricing/{id:020}")
    }
    pub fn option(id: u64) -> String {
        format!("option/{id:020}")
    }
    pub fn option_value(id: u64) -> String {
        format!("option_value/{id:020}")
    }
    pub fn package_group(id: u64) -> String {
        format!("package_group/{id:020}")
    }
    pub fn option_group(id: u64) -> String {
        format!("option_group/{id:020}")
    }
    pub fn service(id: u64) -> String {
        format!("service/{id:020}")
    }
    pub fn service_by_pricing(pricing_id: u64, service_id: u64) -> String {
        format!("{}{service_id:020}", service_by_pricing_prefix(pricing_id))
    }
    pub fn service_by_pricing_prefix(pricing_id: u64) -> String {
        format!("service_pricing/{pricing_id:020}/")
    }
    pub fn service_by_value(value_id: u64, service_id: u64) -> String {
        format!("{}{service_id:020}", service_by_value_prefix(value_id))
    }
    pub fn service_by_value_prefix(value_id: u64) -> String {
        format!("service_value/{value_id:020}/")
    }
    pub fn sequence(kind: &str, company_id: u64, format: &str) -> String {
        format!("sequence/{kind}/{company_id:020}/{format}")
    }
    pub fn company_setting(company_id: u64, name: &str) -> String {
        format!("setting/company/{company_id:020}/{name}")
    }
    pub fn client_group_setting(client_group_id: u64, name: &str) -> String {
        format!("setting/client_group/{client_group_id:020}/{name}")
    }

    pub const PACKAGES: &str = "package/";
    pub const OPTIONS: &str = "option/";
    pub const PACKAGE_GROUPS: &str = "package_group/";
    pub const OPTION_GROUPS: &str = "option_group/";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq)]
    struct Row {
        #[n(0)]
        name: String,
    }

    #[test]
    fn aborted_transaction_leaves_no_writes() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("store.db")).unwrap());
        let store = Store::new(db);

        let result: Result<(), PricingError> = store.transaction(|tx| {
            tx.put("row/1", &Row { name: "first".into() })?;
            abort(PricingError::NotFound { entity: "row", id: 2 })
        });

        assert!(matches!(result, Err(PricingError::NotFound { id: 2, .. })));
        assert_eq!(store.get::<Row>("row/1").unwrap(), None);
    }

    #[test]
    fn reads_inside_transaction_see_own_writes() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("store.db")).unwrap());
        let store = Store::new(db);

        let seen = store
            .transaction(|tx| {
                tx.put("row/1", &Row { name: "first".into() })?;
                tx.get::<Row>("row/1")
            })
            .unwrap();

        assert_eq!(seen, Some(Row { name: "first".into() }));
        assert_eq!(store.scan::<Row>("row/").unwrap().len(), 1);
    }
}
