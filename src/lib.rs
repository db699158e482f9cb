//! An embedded, single-file, crash-tolerant ordered key-value store built on
//! a copy-on-write B+tree.
//!
//! ```no_run
//! use buildingdb::KV;
//!
//! let mut kv = KV::open("my.db").unwrap();
//! kv.set(b"hello", b"world").unwrap();
//! assert_eq!(kv.get(b"hello").unwrap(), Some(b"world".to_vec()));
//! ```

mod btree;
mod error;
mod free_list;
mod kv;
mod node;
mod page;
mod pager;

pub use error::{Error, Result};
pub use kv::KV;
