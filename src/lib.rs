#![allow(dead_code, unused_imports, unused_variables)]

pub mod config;
pub mod storage;
pub mod utils;

pub use crate::storage::db::{Database, SqliteDatabase};
pub use crate::storage::errors::{DbError, StorageError};
pub use crate::storage::message::StreamMessage;
pub use crate::storage::resend::MessageStream;
pub use crate::storage::store::Storage;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global tracing subscriber, filtered by `BROOK_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_new(&Config::global().storage.log_level)
        .unwrap_or_else(|_| EnvFilter::new("error"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
