use crate::{
    kv::{tables, traits::*},
    models::*,
};
use async_trait::async_trait;
use auto_impl::auto_impl;
use std::fmt::{Debug, Display};
use thiserror::Error;
use tracing::*;

#[derive(Clone, Copy, Debug)]
pub struct StageInput {
    pub restarted: bool,
    pub previous_stage: Option<(StageId, BlockNumber)>,
    pub stage_progress: Option<BlockNumber>,
}

#[derive(Clone, Copy, Debug)]
pub struct UnwindInput {
    pub stage_progress: BlockNumber,
    pub unwind_to: BlockNumber,
    /// Hash of the block at `unwind_to` on the chain being unwound to.
    pub unwind_hash: H256,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExecOutput {
    Unwind {
        unwind_to: BlockNumber,
        unwind_hash: H256,
    },
    Progress {
        stage_progress: BlockNumber,
        done: bool,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnwindOutput {
    pub stage_progress: BlockNumber,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("validation failed for block {block}: {reason}")]
    Validation { block: BlockNumber, reason: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
#[auto_impl(&mut, Box)]
pub trait Stage<Tx>: Send + Sync + Debug
where
    Tx: MutableTransaction,
{
    /// ID of the sync stage. Should not be empty and should be unique within a pipeline.
    fn id(&self) -> StageId;
    /// Called when the stage is executed. The main logic of the stage should be here.
    async fn execute(&mut self, tx: &mut Tx, input: StageInput)
        -> Result<ExecOutput, StageError>;
    /// Called when the stage should be unwound. The unwind logic should be there.
    async fn unwind(&mut self, tx: &mut Tx, input: UnwindInput) -> anyhow::Result<UnwindOutput>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub &'static str);

impl AsRef<str> for StageId {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl AsRef<[u8]> for StageId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.0)
    }
}

impl StageId {
    #[instrument(skip(tx))]
    pub fn get_progress<Tx>(&self, tx: &Tx) -> anyhow::Result<Option<BlockNumber>>
    where
        Tx: Transaction,
    {
        tx.get(tables::SyncStageProgress, *self)
    }

    #[instrument(skip(tx))]
    pub fn save_progress<Tx>(&self, tx: &Tx, block: BlockNumber) -> anyhow::Result<()>
    where
        Tx: MutableTransaction,
    {
        tx.set(tables::SyncStageProgress, *self, block)
    }

    #[instrument(skip(tx))]
    pub fn get_unwind<Tx>(&self, tx: &Tx) -> anyhow::Result<Option<tables::UnwindRecord>>
    where
        Tx: Transaction,
    {
        tx.get(tables::SyncStageUnwind, *self)
    }

    #[instrument(skip(tx))]
    pub fn save_unwind<Tx>(&self, tx: &Tx, record: tables::UnwindRecord) -> anyhow::Result<()>
    where
        Tx: MutableTransaction,
    {
        tx.set(tables::SyncStageUnwind, *self, record)
    }

    #[instrument(skip(tx))]
    pub fn delete_unwind<Tx>(&self, tx: &Tx) -> anyhow::Result<bool>
    where
        Tx: MutableTransaction,
    {
        tx.del(tables::SyncStageUnwind, *self)
    }
}
