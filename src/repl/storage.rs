use crate::executor::DbTxn;
use crate::ns::Namespace;
use crate::Result;
use bson::Document;

/// Local storage operations the replication core needs.  All methods run on
/// the executor's DB-work lane with the lock mode recorded in the txn.
pub trait StorageInterface: Send + Sync {
    /// Drop every user database ahead of a resync.
    fn drop_user_databases(&self, txn: &mut DbTxn) -> Result<()>;

    /// Insert a document fetched from the source because a batch referenced
    /// it and it was absent locally.
    fn insert_missing_doc(&self, txn: &mut DbTxn, ns: &Namespace, doc: Document) -> Result<()>;

    /// Bulk insert used by cloners while copying collections.
    fn insert_documents(
        &self,
        txn: &mut DbTxn,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> Result<()>;
}
