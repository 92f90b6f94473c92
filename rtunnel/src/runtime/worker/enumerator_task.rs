use std::collections::BTreeSet;
use std::sync::Arc;

use crate::api::connector::{SplitAssignContext, SplitEnumerator};
use crate::api::runtime::{CheckpointId, TaskLocation};
use crate::api::split::SourceSplit;
use crate::runtime::wire::{ControlOp, OperationMessage};
use crate::runtime::worker::task::{Progress, Task, TaskContext, TaskSnapshot};
use crate::runtime::worker::OperationRouter;

/// Sends assignments to the reader tasks through the operation router. Operations to one
/// reader arrive in send order, which keeps splits ahead of later barriers.
struct RoutedAssignContext<'a> {
    readers: &'a [TaskLocation],
    router: &'a dyn OperationRouter,
    signaled: &'a mut BTreeSet<u32>,
}

impl<'a> RoutedAssignContext<'a> {
    fn reader(&self, subtask_index: u32) -> anyhow::Result<TaskLocation> {
        self.readers
            .get(subtask_index as usize)
            .map(|x| *x)
            .ok_or_else(|| {
                anyhow!(
                    "reader subtask {} out of {}",
                    subtask_index,
                    self.readers.len()
                )
            })
    }
}

impl<'a> SplitAssignContext for RoutedAssignContext<'a> {
    fn parallelism(&self) -> u32 {
        self.readers.len() as u32
    }

    fn assign_splits(&mut self, subtask_index: u32, splits: Vec<SourceSplit>) -> anyhow::Result<()> {
        let location = self.reader(subtask_index)?;
        debug!("assign {} splits to {}", splits.len(), location);
        self.router.route(OperationMessage {
            location,
            op: ControlOp::AssignSplit(splits),
        })?;
        Ok(())
    }

    fn signal_no_more_splits(&mut self, subtask_index: u32) -> anyhow::Result<()> {
        let location = self.reader(subtask_index)?;
        self.router.route(OperationMessage {
            location,
            op: ControlOp::NoMoreSplits,
        })?;
        self.signaled.insert(subtask_index);
        Ok(())
    }
}

/// Global split enumerator of a coordinated source. It relays barriers to its readers and
/// finishes once every reader was told that no more splits will come.
pub(crate) struct SplitEnumeratorTask {
    enumerator: Box<dyn SplitEnumerator>,
    readers: Vec<TaskLocation>,
    router: Arc<dyn OperationRouter>,
    restored: TaskSnapshot,
    started: bool,
    signaled: BTreeSet<u32>,
}

impl SplitEnumeratorTask {
    pub fn new(
        enumerator: Box<dyn SplitEnumerator>,
        readers: Vec<TaskLocation>,
        router: Arc<dyn OperationRouter>,
        restored: TaskSnapshot,
    ) -> Self {
        SplitEnumeratorTask {
            enumerator,
            readers,
            router,
            restored,
            started: false,
            signaled: BTreeSet::new(),
        }
    }

    fn forward(&self, op: ControlOp) {
        for location in &self.readers {
            let message = OperationMessage {
                location: *location,
                op: op.clone(),
            };
            if let Err(e) = self.router.route(message) {
                // a reader that already ended answers through its final snapshot
                debug!("skip forwarding to {}. {}", location, e);
            }
        }
    }
}

impl Task for SplitEnumeratorTask {
    fn open(&mut self, _ctx: &mut TaskContext) -> anyhow::Result<()> {
        self.enumerator.open(self.restored.connector.as_deref())
    }

    fn poll(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress> {
        if !self.started {
            self.started = true;
            let mut context = RoutedAssignContext {
                readers: self.readers.as_slice(),
                router: self.router.as_ref(),
                signaled: &mut self.signaled,
            };
            self.enumerator.run(&mut context)?;
            return Ok(Progress::Busy);
        }

        if self.signaled.len() >= self.readers.len() {
            info!(
                "{} handed out every split to {} readers",
                ctx.task_name,
                self.readers.len()
            );
            Ok(Progress::End)
        } else {
            Ok(Progress::Idle)
        }
    }

    fn handle_op(
        &mut self,
        ctx: &mut TaskContext,
        op: ControlOp,
        _finished: bool,
    ) -> anyhow::Result<()> {
        match op {
            ControlOp::CheckpointBarrier(barrier) => {
                let snapshot = self.snapshot(ctx, barrier.checkpoint_id);
                ctx.report_snapshot(barrier.checkpoint_id, snapshot);
                self.forward(ControlOp::CheckpointBarrier(barrier));
            }
            ControlOp::NotifyCheckpointComplete(_) | ControlOp::Cancel => {}
            op => warn!("{} ignore unexpected {:?}", ctx.task_name, op),
        }
        Ok(())
    }

    fn snapshot(
        &mut self,
        _ctx: &TaskContext,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<TaskSnapshot> {
        Ok(TaskSnapshot {
            connector: Some(self.enumerator.snapshot_state(checkpoint_id)?),
            ..Default::default()
        })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.enumerator.close()
    }
}
