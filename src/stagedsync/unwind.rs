use super::stages::{StageRegistry, SyncStage};
use crate::{
    kv::{tables::UnwindRecord, traits::*},
    models::*,
};
use anyhow::Context;
use std::cmp::Reverse;
use tracing::*;

/// A pending request to roll `stage` back to `unwind_point`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindState {
    pub stage: SyncStage,
    pub unwind_point: BlockNumber,
    pub unwind_hash: H256,
}

impl UnwindState {
    pub fn new(stage: SyncStage, unwind_point: BlockNumber, unwind_hash: H256) -> Self {
        Self {
            stage,
            unwind_point,
            unwind_hash,
        }
    }

    fn record(&self) -> UnwindRecord {
        UnwindRecord {
            unwind_point: self.unwind_point,
            unwind_hash: self.unwind_hash,
        }
    }

    /// Acknowledges a popped request after the stage has been unwound, removing its durable
    /// record.
    ///
    /// The stage slot may meanwhile hold a deeper request that is still queued behind this one;
    /// that record is left untouched.
    pub fn done<Tx: MutableTransaction>(&self, tx: &Tx) -> anyhow::Result<()> {
        let stage_id = self.stage.id;
        match stage_id.get_unwind(tx)? {
            Some(record) if record == self.record() => {
                stage_id.delete_unwind(tx)?;
            }
            Some(record) => {
                debug!(
                    stage = %stage_id,
                    done = %self.unwind_point,
                    pending = %record.unwind_point,
                    "Unwind record belongs to a deeper request, keeping it"
                );
            }
            None => {}
        }

        Ok(())
    }
}

/// Pending unwinds, kept in memory and mirrored into the `SyncStageUnwind` table.
///
/// A request leaves memory on [`pop`](Self::pop) but its record is only removed by
/// [`UnwindState::done`], so a crash in between reloads it on the next start.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PersistentUnwindStack {
    unwind_stack: Vec<UnwindState>,
}

impl PersistentUnwindStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the stack from durable records for every stage in the registry.
    pub fn load<Tx: Transaction>(tx: &Tx, registry: &StageRegistry) -> anyhow::Result<Self> {
        let mut stack = Self::new();
        for stage in registry.iter() {
            stack.add_from_db(tx, stage)?;
        }

        if !stack.is_empty() {
            info!(pending = stack.len(), "Recovered pending unwinds");
        }

        Ok(stack)
    }

    pub fn add_from_db<Tx: Transaction>(
        &mut self,
        tx: &Tx,
        stage: SyncStage,
    ) -> anyhow::Result<()> {
        if let Some(u) = Self::load_from_db(tx, stage)? {
            self.unwind_stack.push(u);
        }

        Ok(())
    }

    pub fn load_from_db<Tx: Transaction>(
        tx: &Tx,
        stage: SyncStage,
    ) -> anyhow::Result<Option<UnwindState>> {
        Ok(stage
            .id
            .get_unwind(tx)
            .with_context(|| format!("failed to load pending unwind for stage {}", stage.id))?
            .map(|record| UnwindState {
                stage,
                unwind_point: record.unwind_point,
                unwind_hash: record.unwind_hash,
            }))
    }

    pub fn is_empty(&self) -> bool {
        self.unwind_stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unwind_stack.len()
    }

    /// Queues `u` unless a request at least as deep is already pending for the same stage.
    pub fn add<Tx: MutableTransaction>(&mut self, u: UnwindState, tx: &Tx) -> anyhow::Result<()> {
        let deepest_pending = self
            .unwind_stack
            .iter()
            .filter(|pending| pending.stage.id == u.stage.id)
            .map(|pending| pending.unwind_point)
            .min();

        if let Some(pending) = deepest_pending {
            if u.unwind_point >= pending {
                trace!(
                    stage = %u.stage.id,
                    requested = %u.unwind_point,
                    pending = %pending,
                    "Unwind already covered"
                );
                return Ok(());
            }
        }

        u.stage.id.save_unwind(tx, u.record())?;
        self.unwind_stack.push(u);

        debug!(stage = %u.stage.id, to = %u.unwind_point, "Unwind queued");

        Ok(())
    }

    /// Takes the most downstream request. Requests of equal order come out first-in first-out.
    pub fn pop(&mut self) -> Option<UnwindState> {
        let idx = self
            .unwind_stack
            .iter()
            .enumerate()
            .min_by_key(|(_, u)| Reverse(u.stage.order))
            .map(|(idx, _)| idx)?;

        Some(self.unwind_stack.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv::{new_mem_database, redb::RedbWriteTransaction, tables, RedbKv},
        stagedsync::stages::*,
    };
    use anyhow::bail;

    fn stages() -> [SyncStage; 3] {
        let registry = StageRegistry::default();
        [
            registry.get(BODIES).unwrap(),
            registry.get(HEADERS).unwrap(),
            registry.get(EXECUTION).unwrap(),
        ]
    }

    const POINTS: [u64; 3] = [10, 20, 30];

    fn fill<Tx: MutableTransaction>(stack: &mut PersistentUnwindStack, tx: &Tx) {
        for (stage, point) in stages().into_iter().zip(POINTS) {
            stack
                .add(UnwindState::new(stage, BlockNumber(point), H256::zero()), tx)
                .unwrap();
        }
    }

    fn reload<Tx: Transaction>(tx: &Tx) -> PersistentUnwindStack {
        let mut stack = PersistentUnwindStack::new();
        for stage in stages() {
            stack.add_from_db(tx, stage).unwrap();
        }
        stack
    }

    #[test]
    fn load_from_db() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        let stack2 = reload(&tx);

        assert_eq!(stack, stack2);
        assert_eq!(stack2.len(), 3);
    }

    #[test]
    fn load_from_db_after_done() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        let u = stack.pop().unwrap();
        u.done(&tx).unwrap();

        let stack2 = reload(&tx);

        assert_eq!(stack, stack2);
        assert_eq!(stack2.len(), 2);
        assert_eq!(PersistentUnwindStack::load_from_db(&tx, u.stage).unwrap(), None);
    }

    #[test]
    fn load_from_db_no_done() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        let u = stack.pop().unwrap();

        let stack2 = reload(&tx);

        assert_ne!(stack, stack2);
        assert_eq!(stack2.len(), 3);
        assert_eq!(
            PersistentUnwindStack::load_from_db(&tx, u.stage).unwrap(),
            Some(u)
        );
    }

    #[test]
    fn load_survives_commit() {
        let db = new_mem_database().unwrap();

        let mut stack = PersistentUnwindStack::new();
        let tx = db.begin_mutable().unwrap();
        fill(&mut stack, &tx);
        tx.commit().unwrap();

        let tx = db.begin().unwrap();
        let registry = StageRegistry::default();
        let mut recovered = PersistentUnwindStack::load(&tx, &registry).unwrap();

        assert_eq!(recovered.len(), 3);
        let order = std::iter::from_fn(|| recovered.pop())
            .map(|u| (u.stage.id, u.unwind_point.0))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![(EXECUTION, 30), (BODIES, 10), (HEADERS, 20)]);
    }

    #[test]
    fn on_disk_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chaindata.redb");
        let registry = StageRegistry::default();

        let popped = {
            let db = RedbKv::open(&path, tables::CHAINDATA_TABLES).unwrap();
            let tx = db.begin_mutable().unwrap();
            let mut stack = PersistentUnwindStack::new();
            fill(&mut stack, &tx);
            tx.commit().unwrap();

            // popped but never acknowledged
            stack.pop().unwrap()
        };

        let popped = {
            let db = RedbKv::open(&path, tables::CHAINDATA_TABLES).unwrap();
            let mut recovered =
                PersistentUnwindStack::load(&db.begin().unwrap(), &registry).unwrap();
            assert_eq!(recovered.len(), 3);

            let u = recovered.pop().unwrap();
            assert_eq!(u, popped);

            let tx = db.begin_mutable().unwrap();
            u.done(&tx).unwrap();
            tx.commit().unwrap();
            u
        };

        let db = RedbKv::open(&path, tables::CHAINDATA_TABLES).unwrap();
        let tx = db.begin().unwrap();
        let recovered = PersistentUnwindStack::load(&tx, &registry).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(
            PersistentUnwindStack::load_from_db(&tx, popped.stage).unwrap(),
            None
        );
    }

    #[test]
    fn pop_and_empty() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        assert!(!stack.is_empty());
        assert!(stack.pop().is_some());

        assert!(!stack.is_empty());
        assert!(stack.pop().is_some());

        assert!(!stack.is_empty());
        assert!(stack.pop().is_some());

        assert!(stack.is_empty());
        assert!(stack.pop().is_none());

        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
    }

    #[test]
    fn pop_most_downstream_first() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let registry = StageRegistry::new([HEADERS, BODIES, EXECUTION, TX_LOOKUP]);
        let mut stack = PersistentUnwindStack::new();
        for id in [BODIES, TX_LOOKUP, EXECUTION] {
            stack
                .add(
                    UnwindState::new(registry.get(id).unwrap(), BlockNumber(5), H256::zero()),
                    &tx,
                )
                .unwrap();
        }

        let orders = std::iter::from_fn(|| stack.pop())
            .map(|u| u.stage.order)
            .collect::<Vec<_>>();
        assert_eq!(orders, vec![3, 2, 1]);
    }

    #[test]
    fn pop_same_stage_in_insertion_order() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let [bodies, headers, _] = stages();
        let mut stack = PersistentUnwindStack::new();
        for (stage, point) in [(bodies, 10), (headers, 20), (bodies, 5)] {
            stack
                .add(UnwindState::new(stage, BlockNumber(point), H256::zero()), &tx)
                .unwrap();
        }

        let popped = std::iter::from_fn(|| stack.pop())
            .map(|u| (u.stage.id, u.unwind_point.0))
            .collect::<Vec<_>>();
        assert_eq!(popped, vec![(BODIES, 10), (BODIES, 5), (HEADERS, 20)]);
    }

    #[test]
    fn override_with_lower() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        assert_eq!(stack.len(), 3);

        let bodies = stages()[0];
        stack
            .add(UnwindState::new(bodies, BlockNumber(5), H256::zero()), &tx)
            .unwrap();

        // we append if the next unwind is to the lower block
        assert_eq!(stack.len(), 4);
        assert_eq!(
            tx.get(tables::SyncStageUnwind, BODIES)
                .unwrap()
                .unwrap()
                .unwind_point,
            BlockNumber(5)
        );
    }

    #[test]
    fn override_with_higher() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        let before = reload(&tx);
        let bodies = stages()[0];
        stack
            .add(UnwindState::new(bodies, BlockNumber(105), H256::zero()), &tx)
            .unwrap();

        // we ignore if next unwind is to the higher block
        assert_eq!(stack.len(), 3);
        assert_eq!(stack, before);
        assert_eq!(reload(&tx), before);
    }

    #[test]
    fn override_with_the_same() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);

        let bodies = stages()[0];
        stack
            .add(
                UnwindState::new(bodies, BlockNumber(10), H256::repeat_byte(0xaa)),
                &tx,
            )
            .unwrap();

        assert_eq!(stack.len(), 3);
        assert_eq!(
            tx.get(tables::SyncStageUnwind, BODIES)
                .unwrap()
                .unwrap()
                .unwind_hash,
            H256::zero()
        );
    }

    #[test]
    fn override_sequence() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let mut stack = PersistentUnwindStack::new();
        fill(&mut stack, &tx);
        assert_eq!(stack.len(), 3);

        let bodies = stages()[0];
        for (point, expected_len) in [(5, 4), (105, 4), (10, 4), (7, 4), (4, 5)] {
            stack
                .add(UnwindState::new(bodies, BlockNumber(point), H256::zero()), &tx)
                .unwrap();
            assert_eq!(stack.len(), expected_len, "after adding Bodies@{}", point);
        }
    }

    #[test]
    fn done_keeps_deeper_pending_record() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let bodies = stages()[0];
        let mut stack = PersistentUnwindStack::new();
        stack
            .add(UnwindState::new(bodies, BlockNumber(10), H256::zero()), &tx)
            .unwrap();
        stack
            .add(UnwindState::new(bodies, BlockNumber(5), H256::zero()), &tx)
            .unwrap();

        let shallow = stack.pop().unwrap();
        assert_eq!(shallow.unwind_point, BlockNumber(10));
        shallow.done(&tx).unwrap();

        let recovered = PersistentUnwindStack::load_from_db(&tx, bodies)
            .unwrap()
            .unwrap();
        assert_eq!(recovered.unwind_point, BlockNumber(5));

        let deep = stack.pop().unwrap();
        assert_eq!(deep, recovered);
        deep.done(&tx).unwrap();

        assert_eq!(PersistentUnwindStack::load_from_db(&tx, bodies).unwrap(), None);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn add_after_pop_requeues_stage() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let bodies = stages()[0];
        let mut stack = PersistentUnwindStack::new();
        stack
            .add(UnwindState::new(bodies, BlockNumber(10), H256::zero()), &tx)
            .unwrap();
        stack.pop().unwrap();

        stack
            .add(UnwindState::new(bodies, BlockNumber(50), H256::zero()), &tx)
            .unwrap();

        assert_eq!(stack.len(), 1);
        assert_eq!(
            PersistentUnwindStack::load_from_db(&tx, bodies)
                .unwrap()
                .unwrap()
                .unwind_point,
            BlockNumber(50)
        );
    }

    #[test]
    fn unwind_to_genesis_is_kept() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let headers = stages()[1];
        let mut stack = PersistentUnwindStack::new();
        stack
            .add(UnwindState::new(headers, BlockNumber(0), H256::zero()), &tx)
            .unwrap();

        assert_eq!(reload(&tx).len(), 1);
    }

    /// Transaction whose writes always fail.
    struct BrokenTx(RedbWriteTransaction);

    impl Transaction for BrokenTx {
        fn get_raw(&self, table: &'static str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            self.0.get_raw(table, key)
        }
    }

    impl MutableTransaction for BrokenTx {
        fn set_raw(&self, _: &'static str, _: &[u8], _: &[u8]) -> anyhow::Result<()> {
            bail!("disk full")
        }

        fn del_raw(&self, _: &'static str, _: &[u8]) -> anyhow::Result<bool> {
            bail!("disk full")
        }

        fn commit(self) -> anyhow::Result<()> {
            bail!("disk full")
        }
    }

    #[test]
    fn failed_write_leaves_stack_untouched() {
        let db = new_mem_database().unwrap();
        let tx = BrokenTx(db.begin_mutable().unwrap());

        let bodies = stages()[0];
        let mut stack = PersistentUnwindStack::new();
        let err = stack
            .add(UnwindState::new(bodies, BlockNumber(10), H256::zero()), &tx)
            .unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
    }

    #[test]
    fn failed_done_keeps_record() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let bodies = stages()[0];
        let mut stack = PersistentUnwindStack::new();
        stack
            .add(UnwindState::new(bodies, BlockNumber(10), H256::zero()), &tx)
            .unwrap();
        tx.commit().unwrap();

        let u = stack.pop().unwrap();
        let tx = BrokenTx(db.begin_mutable().unwrap());
        assert!(u.done(&tx).is_err());

        let tx = db.begin().unwrap();
        assert_eq!(
            PersistentUnwindStack::load_from_db(&tx, bodies).unwrap(),
            Some(u)
        );
    }

    #[test]
    fn malformed_record_fails_reload() {
        let db = new_mem_database().unwrap();
        let tx = db.begin_mutable().unwrap();

        let bodies = stages()[0];
        tx.set_raw(
            tables::SyncStageUnwind::const_db_name(),
            BODIES.0.as_bytes(),
            &[1, 2, 3],
        )
        .unwrap();

        let mut stack = PersistentUnwindStack::new();
        let err = stack.add_from_db(&tx, bodies).unwrap_err();

        assert!(err.to_string().contains("Bodies"), "{:?}", err);
        assert!(stack.is_empty());
    }
}
