pub mod binutil;
pub mod kv;
pub mod models;
pub mod stagedsync;

pub use kv::{
    new_database, new_mem_database,
    traits::{MutableKV, MutableTransaction, Transaction, KV},
};
pub use stagedsync::{
    stage::StageId,
    unwind::{PersistentUnwindStack, UnwindState},
    StagedSync,
};
