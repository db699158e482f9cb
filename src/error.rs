//! Closed error taxonomy for the store. Programmer errors (a malformed page,
//! an out-of-range index) are not represented here; they panic, per the
//! invariant violations described in the design notes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key is empty")]
    KeyEmpty,

    #[error("key exceeds {} bytes", crate::page::BTREE_MAX_KEY_SIZE)]
    KeyTooLong,

    #[error("value exceeds {} bytes", crate::page::BTREE_MAX_VAL_SIZE)]
    ValTooLong,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, Error>;
