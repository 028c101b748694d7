use super::stage::StageId;

pub const HEADERS: StageId = StageId("Headers");
pub const BLOCK_HASHES: StageId = StageId("BlockHashes");
pub const BODIES: StageId = StageId("Bodies");
pub const SENDERS: StageId = StageId("Senders");
pub const EXECUTION: StageId = StageId("Execution");
pub const HASH_STATE: StageId = StageId("HashState");
pub const INTERMEDIATE_HASHES: StageId = StageId("IntermediateHashes");
pub const ACCOUNT_HISTORY_INDEX: StageId = StageId("AccountHistoryIndex");
pub const STORAGE_HISTORY_INDEX: StageId = StageId("StorageHistoryIndex");
pub const LOG_INDEX: StageId = StageId("LogIndex");
pub const CALL_TRACES: StageId = StageId("CallTraces");
pub const TX_LOOKUP: StageId = StageId("TxLookup");
pub const FINISH: StageId = StageId("Finish");

/// Full-node pipeline, upstream first.
pub const DEFAULT_STAGES: &[StageId] = &[
    HEADERS,
    BLOCK_HASHES,
    BODIES,
    SENDERS,
    EXECUTION,
    HASH_STATE,
    INTERMEDIATE_HASHES,
    ACCOUNT_HISTORY_INDEX,
    STORAGE_HISTORY_INDEX,
    LOG_INDEX,
    CALL_TRACES,
    TX_LOOKUP,
    FINISH,
];

/// A stage together with its fixed position in the pipeline. Later stages consume what earlier
/// ones produce, so a higher `order` means further downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncStage {
    pub id: StageId,
    pub order: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageRegistry {
    stages: Vec<SyncStage>,
}

impl StageRegistry {
    /// Assigns orders 0, 1, 2... in the given sequence. A repeated id keeps its first position.
    pub fn new<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = StageId>,
    {
        let mut stages = Vec::<SyncStage>::new();
        for id in ids {
            if stages.iter().all(|stage| stage.id != id) {
                stages.push(SyncStage {
                    id,
                    order: stages.len(),
                });
            }
        }

        Self { stages }
    }

    pub fn get(&self, id: StageId) -> Option<SyncStage> {
        self.stages.iter().find(|stage| stage.id == id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = SyncStage> + '_ {
        self.stages.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STAGES.iter().copied())
    }
}
