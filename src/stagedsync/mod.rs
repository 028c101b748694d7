pub mod stage;
pub mod stages;
pub mod unwind;

use self::{
    stage::{ExecOutput, Stage, StageError, StageInput, UnwindInput},
    stages::StageRegistry,
    unwind::{PersistentUnwindStack, UnwindState},
};
use crate::{
    kv::{tables, traits::*},
    models::*,
};
use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tracing::*;

#[async_trait]
pub trait SyncActivator: Send + Sync + 'static {
    async fn wait(&self);
}

#[async_trait]
impl<F: Fn() -> Fut + Send + Sync + 'static, Fut: Future<Output = ()> + Send> SyncActivator for F {
    async fn wait(&self) {
        (self)().await
    }
}

/// Why a forward pass stopped before the last stage.
#[derive(Clone, Copy, Debug)]
struct UnwindTrigger {
    unwind_to: BlockNumber,
    unwind_hash: H256,
}

/// Staged sync driver: runs stages forward in pipeline order and drains the persistent unwind
/// stack whenever something has to be rolled back.
pub struct StagedSync<DB: MutableKV> {
    stages: Vec<Box<dyn Stage<DB::MutableTx>>>,
    sync_activator: Box<dyn SyncActivator>,
    start_with_unwind: Option<BlockNumber>,
    exit_after_sync: bool,
    delay_after_sync: Option<Duration>,
}

impl<DB: MutableKV> StagedSync<DB> {
    pub fn new<A>(sync_activator: A) -> Self
    where
        A: SyncActivator,
    {
        Self {
            stages: Vec::new(),
            sync_activator: Box::new(sync_activator),
            start_with_unwind: None,
            exit_after_sync: false,
            delay_after_sync: None,
        }
    }

    pub fn push<S>(&mut self, stage: S)
    where
        S: Stage<DB::MutableTx> + 'static,
    {
        self.stages.push(Box::new(stage))
    }

    pub fn start_with_unwind(&mut self, block: BlockNumber) {
        self.start_with_unwind = Some(block);
    }

    pub fn set_exit_after_sync(&mut self, v: bool) {
        self.exit_after_sync = v;
    }

    pub fn set_delay_after_sync(&mut self, v: Option<Duration>) {
        self.delay_after_sync = v;
    }

    pub fn registry(&self) -> StageRegistry {
        StageRegistry::new(self.stages.iter().map(|stage| stage.id()))
    }

    /// Runs the pipeline. Pending unwinds left by a previous run are drained before anything
    /// else. Returns after the first complete pass if `exit_after_sync` is set, otherwise loops
    /// forever.
    pub async fn run(&mut self, db: &DB) -> anyhow::Result<()> {
        let registry = self.registry();

        let mut unwind_stack = {
            let tx = db.begin_mutable()?;
            let mut stack = PersistentUnwindStack::load(&tx, &registry)?;

            if let Some(to) = self.start_with_unwind.take() {
                info!(to = %to, "Starting with unwind");
                let unwind_hash = tx
                    .get(tables::CanonicalHeader, to)?
                    .unwrap_or_default();
                for stage in registry.iter() {
                    stack.add(UnwindState::new(stage, to, unwind_hash), &tx)?;
                }
            }

            tx.commit()?;
            stack
        };

        loop {
            if !unwind_stack.is_empty() {
                if let Some(lowest) = self.drain_unwinds(db, &mut unwind_stack).await? {
                    info!(from = %lowest, "Unwinds complete, resuming sync");
                }
            }

            let mut tx = db.begin_mutable()?;
            match self.forward(&mut tx).await? {
                Some(UnwindTrigger {
                    unwind_to,
                    unwind_hash,
                }) => {
                    for stage in registry.iter() {
                        unwind_stack.add(UnwindState::new(stage, unwind_to, unwind_hash), &tx)?;
                    }
                    tx.commit()?;
                }
                None => {
                    tx.commit()?;

                    if self.exit_after_sync {
                        return Ok(());
                    }

                    if let Some(delay) = self.delay_after_sync {
                        tokio::time::sleep(delay).await;
                    }

                    self.sync_activator.wait().await;
                }
            }
        }
    }

    async fn forward(&mut self, tx: &mut DB::MutableTx) -> anyhow::Result<Option<UnwindTrigger>> {
        let num_stages = self.stages.len();

        let mut previous_stage = None;
        let mut timings = vec![];
        info!("Starting staged sync");
        for (stage_index, stage) in self.stages.iter_mut().enumerate() {
            let mut restarted = false;

            let stage_id = stage.id();

            let start_time = std::time::Instant::now();
            let done_progress = loop {
                let stage_progress = stage_id.get_progress(&*tx)?;

                let exec_output = async {
                    if !restarted {
                        info!("RUNNING");
                    }

                    let output = stage
                        .execute(
                            tx,
                            StageInput {
                                restarted,
                                previous_stage,
                                stage_progress,
                            },
                        )
                        .await;

                    match &output {
                        Ok(ExecOutput::Progress { done: true, .. }) => {
                            info!("DONE");
                        }
                        Ok(ExecOutput::Unwind { unwind_to, .. }) => {
                            info!(to = %unwind_to, "Unwind requested");
                        }
                        Err(StageError::Validation { block, reason }) => {
                            warn!(block = %block, "Validation failed: {}", reason);
                        }
                        _ => {}
                    }

                    output
                }
                .instrument(span!(
                    Level::INFO,
                    "",
                    " {}/{} {} ",
                    stage_index + 1,
                    num_stages,
                    AsRef::<str>::as_ref(&stage_id)
                ))
                .await;

                match exec_output {
                    Ok(ExecOutput::Progress {
                        stage_progress,
                        done,
                    }) => {
                        stage_id.save_progress(&*tx, stage_progress)?;

                        if done {
                            break stage_progress;
                        }

                        restarted = true
                    }
                    Ok(ExecOutput::Unwind {
                        unwind_to,
                        unwind_hash,
                    }) => {
                        return Ok(Some(UnwindTrigger {
                            unwind_to,
                            unwind_hash,
                        }));
                    }
                    Err(StageError::Validation { block, .. }) => {
                        let unwind_to = block.parent();
                        let unwind_hash = tx
                            .get(tables::CanonicalHeader, unwind_to)?
                            .unwrap_or_default();
                        return Ok(Some(UnwindTrigger {
                            unwind_to,
                            unwind_hash,
                        }));
                    }
                    Err(StageError::Internal(e)) => {
                        return Err(e.context(format!("stage {} failed", stage_id)));
                    }
                }
            };
            timings.push((stage_id, std::time::Instant::now() - start_time));

            previous_stage = Some((stage_id, done_progress))
        }

        let t = timings
            .into_iter()
            .fold(String::new(), |acc, (stage_id, time)| {
                format!("{} {}={}ms", acc, stage_id, time.as_millis())
            });
        info!("Staged sync complete.{}", t);

        Ok(None)
    }

    /// Pops and executes pending unwinds until the stack is empty, one transaction per request.
    /// Returns the lowest height any stage was unwound to.
    ///
    /// On failure the current request's record is left in place and the error is returned; the
    /// next [`run`](Self::run) reloads it.
    pub async fn drain_unwinds(
        &mut self,
        db: &DB,
        unwind_stack: &mut PersistentUnwindStack,
    ) -> anyhow::Result<Option<BlockNumber>> {
        let num_stages = self.stages.len();

        let mut lowest = None;
        while let Some(u) = unwind_stack.pop() {
            let mut tx = db.begin_mutable()?;

            let stage_id = u.stage.id;
            let stage = self
                .stages
                .iter_mut()
                .find(|stage| stage.id() == stage_id)
                .ok_or_else(|| anyhow::format_err!("stage {} is not in this pipeline", stage_id))?;

            async {
                if let Some(stage_progress) = stage_id.get_progress(&tx)? {
                    if stage_progress > u.unwind_point {
                        info!("RUNNING");

                        let output = stage
                            .unwind(
                                &mut tx,
                                UnwindInput {
                                    stage_progress,
                                    unwind_to: u.unwind_point,
                                    unwind_hash: u.unwind_hash,
                                },
                            )
                            .await
                            .map_err(|e| e.context(format!("failed to unwind {}", stage_id)))?;

                        stage_id.save_progress(&tx, output.stage_progress)?;

                        info!("DONE");
                    } else {
                        info!(
                            unwind_point = %u.unwind_point,
                            progress = %stage_progress,
                            "Unwind point too far for stage"
                        );
                    }
                } else {
                    info!("Stage never run, skipping");
                }

                u.done(&tx)?;
                tx.commit()?;

                Ok::<_, anyhow::Error>(())
            }
            .instrument(span!(
                Level::INFO,
                "",
                " Unwinding {}/{} {} ",
                u.stage.order + 1,
                num_stages,
                AsRef::<str>::as_ref(&stage_id)
            ))
            .await?;

            lowest = Some(lowest.map_or(u.unwind_point, |l: BlockNumber| l.min(u.unwind_point)));
        }

        Ok(lowest)
    }
}
