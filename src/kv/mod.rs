pub mod redb;
pub mod tables;
pub mod traits;

pub use self::redb::RedbKv;

use std::path::Path;

/// Throwaway store on the in-memory redb backend, mostly for tests.
pub fn new_mem_database() -> anyhow::Result<RedbKv> {
    RedbKv::open_in_memory(tables::CHAINDATA_TABLES)
}

pub fn new_database(path: &Path) -> anyhow::Result<RedbKv> {
    RedbKv::open(path, tables::CHAINDATA_TABLES)
}
