use std::fmt::Debug;

pub trait TableEncode: Send + Sync + Sized {
    type Encoded: AsRef<[u8]> + Send + Sync;

    fn encode(self) -> Self::Encoded;
}

pub trait TableDecode: Send + Sync + Sized {
    fn decode(b: &[u8]) -> anyhow::Result<Self>;
}

pub trait TableObject: TableEncode + TableDecode {}

impl<T> TableObject for T where T: TableEncode + TableDecode {}

pub trait Table: Send + Sync + Debug + 'static {
    type Key: TableEncode;
    type Value: TableObject;

    fn db_name(&self) -> &'static str;
}

pub trait KV: Send + Sync {
    type Tx: Transaction;

    fn begin(&self) -> anyhow::Result<Self::Tx>;
}

pub trait MutableKV: KV {
    type MutableTx: MutableTransaction;

    fn begin_mutable(&self) -> anyhow::Result<Self::MutableTx>;
}

pub trait Transaction {
    fn get_raw(&self, table: &'static str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    fn get<T: Table>(&self, table: T, key: T::Key) -> anyhow::Result<Option<T::Value>> {
        let table_name = table.db_name();
        match self.get_raw(table_name, key.encode().as_ref())? {
            Some(v) => T::Value::decode(&v)
                .map(Some)
                .map_err(|e| e.context(format!("failed to decode value in table {}", table_name))),
            None => Ok(None),
        }
    }
}

/// Write side of a transaction. Nothing written through it is visible to other transactions
/// until [`MutableTransaction::commit`]; dropping it aborts.
pub trait MutableTransaction: Transaction + Send + 'static {
    fn set_raw(&self, table: &'static str, key: &[u8], value: &[u8]) -> anyhow::Result<()>;

    /// Returns whether the key was present.
    fn del_raw(&self, table: &'static str, key: &[u8]) -> anyhow::Result<bool>;

    fn commit(self) -> anyhow::Result<()>;

    fn set<T: Table>(&self, table: T, k: T::Key, v: T::Value) -> anyhow::Result<()> {
        self.set_raw(table.db_name(), k.encode().as_ref(), v.encode().as_ref())
    }

    fn del<T: Table>(&self, table: T, k: T::Key) -> anyhow::Result<bool> {
        self.del_raw(table.db_name(), k.encode().as_ref())
    }
}
