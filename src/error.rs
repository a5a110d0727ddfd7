use thiserror::Error;

use crate::transaction::TrxId;

pub type DbResult<T> = Result<T, DbError>;

/// Failure classes surfaced by the engine. Lock timeouts do not exist here;
/// the only way a blocked request fails is deadlock.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("key {0} already exists")]
    DuplicateKey(i64),

    #[error("key {0} not found")]
    KeyNotFound(i64),

    #[error("value length {0} outside supported range")]
    ValueSize(usize),

    #[error("table {0} is not open")]
    UnknownTable(i64),

    #[error("too many open tables")]
    TableLimit,

    #[error("transaction {0} is not active")]
    InactiveTransaction(TrxId),

    #[error("transaction {0} aborted to break a deadlock")]
    Deadlock(TrxId),

    #[error("page {pagenum} of table {table_id} is corrupt: {reason}")]
    CorruptPage {
        table_id: i64,
        pagenum: u64,
        reason: &'static str,
    },

    #[error("log record at offset {0} is corrupt")]
    CorruptLog(u64),
}
