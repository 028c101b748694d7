use super::traits::*;
use ::redb::{
    backends::InMemoryBackend, Database, ReadTransaction, ReadableTable, TableDefinition,
    WriteTransaction,
};
use anyhow::format_err;
use std::path::Path;

fn table_definition(name: &'static str) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Store backed by redb, either on disk or held entirely in memory.
pub struct RedbKv {
    inner: Database,
}

impl RedbKv {
    /// Opens or creates the database at `path` and makes sure every table in `chart` exists, so
    /// read transactions never trip over a missing table.
    pub fn open(path: &Path, chart: &[&'static str]) -> anyhow::Result<Self> {
        let inner = Database::create(path)
            .map_err(|e| format_err!("failed to open database at {}: {}", path.display(), e))?;

        Self::with_tables(inner, chart)
    }

    /// Same engine without a file behind it. Contents are lost on drop.
    pub fn open_in_memory(chart: &[&'static str]) -> anyhow::Result<Self> {
        let inner = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| format_err!("failed to create in-memory database: {}", e))?;

        Self::with_tables(inner, chart)
    }

    fn with_tables(inner: Database, chart: &[&'static str]) -> anyhow::Result<Self> {
        let tx = inner
            .begin_write()
            .map_err(|e| format_err!("redb begin_write: {}", e))?;
        for &table in chart {
            tx.open_table(table_definition(table))
                .map_err(|e| format_err!("failed to create table {}: {}", table, e))?;
        }
        tx.commit().map_err(|e| format_err!("redb commit: {}", e))?;

        Ok(Self { inner })
    }
}

impl std::fmt::Debug for RedbKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbKv").finish_non_exhaustive()
    }
}

impl KV for RedbKv {
    type Tx = RedbReadTransaction;

    fn begin(&self) -> anyhow::Result<Self::Tx> {
        Ok(RedbReadTransaction {
            inner: self
                .inner
                .begin_read()
                .map_err(|e| format_err!("redb begin_read: {}", e))?,
        })
    }
}

impl MutableKV for RedbKv {
    type MutableTx = RedbWriteTransaction;

    fn begin_mutable(&self) -> anyhow::Result<Self::MutableTx> {
        Ok(RedbWriteTransaction {
            inner: self
                .inner
                .begin_write()
                .map_err(|e| format_err!("redb begin_write: {}", e))?,
        })
    }
}

pub struct RedbReadTransaction {
    inner: ReadTransaction,
}

impl Transaction for RedbReadTransaction {
    fn get_raw(&self, table: &'static str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let t = self
            .inner
            .open_table(table_definition(table))
            .map_err(|e| format_err!("failed to open table {}: {}", table, e))?;
        let value = t
            .get(key)
            .map_err(|e| format_err!("failed to read from {}: {}", table, e))?
            .map(|guard| guard.value().to_vec());

        Ok(value)
    }
}

pub struct RedbWriteTransaction {
    inner: WriteTransaction,
}

impl Transaction for RedbWriteTransaction {
    fn get_raw(&self, table: &'static str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let t = self
            .inner
            .open_table(table_definition(table))
            .map_err(|e| format_err!("failed to open table {}: {}", table, e))?;
        let value = t
            .get(key)
            .map_err(|e| format_err!("failed to read from {}: {}", table, e))?
            .map(|guard| guard.value().to_vec());

        Ok(value)
    }
}

impl MutableTransaction for RedbWriteTransaction {
    fn set_raw(&self, table: &'static str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut t = self
            .inner
            .open_table(table_definition(table))
            .map_err(|e| format_err!("failed to open table {}: {}", table, e))?;
        t.insert(key, value)
            .map_err(|e| format_err!("failed to write to {}: {}", table, e))?;

        Ok(())
    }

    fn del_raw(&self, table: &'static str, key: &[u8]) -> anyhow::Result<bool> {
        let mut t = self
            .inner
            .open_table(table_definition(table))
            .map_err(|e| format_err!("failed to open table {}: {}", table, e))?;
        let existed = t
            .remove(key)
            .map_err(|e| format_err!("failed to delete from {}: {}", table, e))?
            .is_some();

        Ok(existed)
    }

    fn commit(self) -> anyhow::Result<()> {
        self.inner
            .commit()
            .map_err(|e| format_err!("redb commit: {}", e))
    }
}
