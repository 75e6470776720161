pub mod config;
pub mod error;
pub mod flock;
pub mod hash;
pub mod memtable;
pub mod qsbr;
pub mod record;
pub mod store;
pub mod view;
pub mod wal;
pub mod zone;

pub use config::{Config, WorkerCores};
pub use error::{Error, Result};
pub use record::{Record, MAX_KV_LEN};
pub use store::{Db, DbIter, DbRef, MergeUpdate};
