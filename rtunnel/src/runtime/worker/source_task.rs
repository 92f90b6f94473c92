use crate::api::checkpoint::CheckpointBarrier;
use crate::api::connector::{PollStatus, SourceReader, SplitAssignContext, SplitEnumerator};
use crate::api::runtime::CheckpointId;
use crate::api::split::SourceSplit;
use crate::runtime::wire::ControlOp;
use crate::runtime::worker::io::Output;
use crate::runtime::worker::task::{Progress, Task, TaskContext, TaskSnapshot};

/// Assignment context of the private enumerator of a parallel source reader: only the
/// splits of its own subtask are kept.
struct LocalAssignContext {
    subtask_index: u32,
    parallelism: u32,
    splits: Vec<SourceSplit>,
    no_more_splits: bool,
}

impl SplitAssignContext for LocalAssignContext {
    fn parallelism(&self) -> u32 {
        self.parallelism
    }

    fn assign_splits(&mut self, subtask_index: u32, splits: Vec<SourceSplit>) -> anyhow::Result<()> {
        if subtask_index == self.subtask_index {
            self.splits.extend(splits);
        }
        Ok(())
    }

    fn signal_no_more_splits(&mut self, subtask_index: u32) -> anyhow::Result<()> {
        if subtask_index == self.subtask_index {
            self.no_more_splits = true;
        }
        Ok(())
    }
}

pub(crate) struct SourceReaderTask {
    reader: Box<dyn SourceReader>,
    /// `Some` when the source runs in parallel mode
    enumerator: Option<Box<dyn SplitEnumerator>>,
    output: Output,
    restored: TaskSnapshot,
}

impl SourceReaderTask {
    pub fn new(
        reader: Box<dyn SourceReader>,
        enumerator: Option<Box<dyn SplitEnumerator>>,
        output: Output,
        restored: TaskSnapshot,
    ) -> Self {
        SourceReaderTask {
            reader,
            enumerator,
            output,
            restored,
        }
    }

    fn checkpoint(
        &mut self,
        ctx: &mut TaskContext,
        barrier: CheckpointBarrier,
    ) -> anyhow::Result<()> {
        let snapshot = self.snapshot(ctx, barrier.checkpoint_id);
        ctx.report_snapshot(barrier.checkpoint_id, snapshot);
        self.output.barrier(barrier)
    }
}

impl Task for SourceReaderTask {
    fn open(&mut self, ctx: &mut TaskContext) -> anyhow::Result<()> {
        self.reader.open(self.restored.connector.as_deref())?;

        if let Some(enumerator) = self.enumerator.as_mut() {
            enumerator.open(self.restored.enumerator.as_deref())?;
            let mut context = LocalAssignContext {
                subtask_index: ctx.subtask_index,
                parallelism: ctx.parallelism,
                splits: Vec::new(),
                no_more_splits: false,
            };
            enumerator.run(&mut context)?;

            debug!(
                "{} enumerated {} splits for itself",
                ctx.task_name,
                context.splits.len()
            );
            if !context.splits.is_empty() {
                self.reader.add_splits(context.splits);
            }
            if context.no_more_splits {
                self.reader.handle_no_more_splits();
            }
        }

        self.output.open(ctx.job_id, &self.restored)
    }

    fn poll(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress> {
        match self.reader.poll_next(&mut self.output)? {
            PollStatus::MoreAvailable => Ok(Progress::Busy),
            PollStatus::NothingAvailable => Ok(Progress::Idle),
            PollStatus::End => {
                info!("{} reached the end of its splits", ctx.task_name);
                self.output.end()?;
                Ok(Progress::End)
            }
        }
    }

    fn handle_op(
        &mut self,
        ctx: &mut TaskContext,
        op: ControlOp,
        finished: bool,
    ) -> anyhow::Result<()> {
        match op {
            ControlOp::AssignSplit(splits) => {
                if finished {
                    warn!("{} finished, drop {} splits", ctx.task_name, splits.len());
                } else {
                    self.reader.add_splits(splits);
                }
            }
            ControlOp::NoMoreSplits => self.reader.handle_no_more_splits(),
            ControlOp::CheckpointBarrier(barrier) => {
                // after the end marker the final snapshot stands in for the ack
                if !finished {
                    self.checkpoint(ctx, barrier)?;
                }
            }
            ControlOp::NotifyCheckpointComplete(checkpoint_id) => {
                self.reader.notify_checkpoint_complete(checkpoint_id)?
            }
            ControlOp::Cancel => {}
        }
        Ok(())
    }

    fn snapshot(
        &mut self,
        _ctx: &TaskContext,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<TaskSnapshot> {
        let enumerator = match self.enumerator.as_mut() {
            Some(enumerator) => Some(enumerator.snapshot_state(checkpoint_id)?),
            None => None,
        };
        Ok(TaskSnapshot {
            connector: Some(self.reader.snapshot_state(checkpoint_id)?),
            enumerator,
            input_offsets: vec![],
            output_written: self.output.written(),
        })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(enumerator) = self.enumerator.as_mut() {
            enumerator.close()?;
        }
        self.reader.close()
    }
}
