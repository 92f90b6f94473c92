use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::checkpoint::CheckpointBarrier;
use crate::api::connector::{SinkWriter, Transform};
use crate::api::element::{Element, Row};
use crate::api::runtime::CheckpointId;
use crate::channel::select::ChannelSelect;
use crate::channel::{ElementReceiver, TryRecvError};
use crate::metrics::metric::Counter;
use crate::runtime::intermediate::IntermediateStore;
use crate::runtime::wire::ControlOp;
use crate::runtime::worker::aligner::{AlignResult, BarrierAligner};
use crate::runtime::worker::io::{IntermediateReader, Output, READ_BATCH};
use crate::runtime::worker::task::{Progress, Task, TaskContext, TaskSnapshot};

pub(crate) enum Operator {
    Transform(Box<dyn Transform>),
    Sink {
        writer: Box<dyn SinkWriter>,
        /// prepared at a barrier, committed once that checkpoint completed
        commits: BTreeMap<CheckpointId, Option<Vec<u8>>>,
    },
}

impl Operator {
    pub fn sink(writer: Box<dyn SinkWriter>) -> Self {
        Operator::Sink {
            writer,
            commits: BTreeMap::new(),
        }
    }
}

/// Where the rows of a transform or sink come from. Within a pipeline they arrive over
/// in-group channels and barriers are aligned; at the head of a pipeline they are read
/// from intermediate datasets and barriers arrive as control operations.
pub(crate) enum Inputs {
    Local {
        receivers: Vec<ElementReceiver>,
        aligner: BarrierAligner,
    },
    Intermediate {
        readers: Vec<IntermediateReader>,
        store: Arc<IntermediateStore>,
    },
}

impl Inputs {
    pub fn local(receivers: Vec<ElementReceiver>) -> Self {
        let aligner = BarrierAligner::new(receivers.len());
        Inputs::Local { receivers, aligner }
    }
}

pub(crate) struct OperatorTask {
    operator: Operator,
    inputs: Inputs,
    output: Output,
    restored: TaskSnapshot,
    rows_in: Counter,
}

impl OperatorTask {
    pub fn new(
        operator: Operator,
        inputs: Inputs,
        output: Output,
        restored: TaskSnapshot,
        rows_in: Counter,
    ) -> Self {
        OperatorTask {
            operator,
            inputs,
            output,
            restored,
            rows_in,
        }
    }

    fn process(&mut self, row: Row) -> anyhow::Result<()> {
        self.rows_in.fetch_add(1);
        match &mut self.operator {
            Operator::Transform(transform) => {
                if let Some(row) = transform.map(row)? {
                    self.output.emit(row)?;
                }
            }
            Operator::Sink { writer, .. } => writer.write(row)?,
        }
        Ok(())
    }

    fn checkpoint(
        &mut self,
        ctx: &mut TaskContext,
        barrier: CheckpointBarrier,
    ) -> anyhow::Result<()> {
        let checkpoint_id = barrier.checkpoint_id;
        let prepared = match &mut self.operator {
            Operator::Sink { writer, commits } => writer.prepare_commit().map(|info| {
                commits.insert(checkpoint_id, info);
            }),
            Operator::Transform(_) => Ok(()),
        };
        let snapshot = prepared.and_then(|_| self.snapshot(ctx, checkpoint_id));
        ctx.report_snapshot(checkpoint_id, snapshot);
        self.output.barrier(barrier)
    }

    /// Every input ended: a sink commits what is left on its own, nobody will complete
    /// another checkpoint for it.
    fn finish(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress> {
        if let Operator::Sink { writer, commits } = &mut self.operator {
            let info = writer.prepare_commit()?;
            commits.insert(ctx.last_checkpoint_id.next(), info);
            for (checkpoint_id, info) in std::mem::take(commits) {
                writer.notify_checkpoint_complete(checkpoint_id, info.as_deref())?;
            }
        }
        self.output.end()?;
        info!("{} consumed all inputs", ctx.task_name);
        Ok(Progress::End)
    }

    fn poll_local(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress> {
        let index = {
            let (receivers, aligner) = match &self.inputs {
                Inputs::Local { receivers, aligner } => (receivers, aligner),
                Inputs::Intermediate { .. } => return Ok(Progress::Idle),
            };
            if aligner.all_ended() {
                return self.finish(ctx);
            }

            let readable: Vec<usize> = (0..receivers.len())
                .filter(|i| aligner.is_readable(*i))
                .collect();
            let mut select = ChannelSelect::new();
            for i in &readable {
                select.recv(&receivers[*i]);
            }
            let ops_index = select.recv_raw(&ctx.ops);
            match select.ready_timeout(ctx.poll_policy.idle_backoff()) {
                None => return Ok(Progress::Waited),
                Some(i) if i == ops_index => return Ok(Progress::Busy),
                Some(i) => readable[i],
            }
        };

        for _ in 0..READ_BATCH {
            let element = match &self.inputs {
                Inputs::Local { receivers, aligner } => {
                    if !aligner.is_readable(index) {
                        break;
                    }
                    match receivers[index].try_recv() {
                        Ok(element) => element,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            if !ctx.is_running() {
                                return Ok(Progress::Waited);
                            }
                            return Err(anyhow!(
                                "input {} closed without an end marker",
                                receivers[index].name()
                            ));
                        }
                    }
                }
                Inputs::Intermediate { .. } => break,
            };

            let aligned = match element {
                Element::Record(row) => {
                    self.process(row)?;
                    AlignResult::Pending
                }
                Element::Barrier(barrier) => match &mut self.inputs {
                    Inputs::Local { aligner, .. } => aligner.on_barrier(index, barrier)?,
                    Inputs::Intermediate { .. } => AlignResult::Pending,
                },
                Element::End => match &mut self.inputs {
                    Inputs::Local { aligner, .. } => aligner.on_end(index),
                    Inputs::Intermediate { .. } => AlignResult::Pending,
                },
            };
            if let AlignResult::Aligned(barrier) = aligned {
                self.checkpoint(ctx, barrier)?;
            }
        }

        Ok(Progress::Busy)
    }

    fn poll_intermediate(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress> {
        let mut rows = Vec::new();
        let all_ended = match &mut self.inputs {
            Inputs::Intermediate { readers, store } => {
                for reader in readers.iter_mut().filter(|r| !r.is_ended()) {
                    rows.extend(reader.read(store.as_ref())?.rows);
                }
                readers.iter().all(|r| r.is_ended())
            }
            Inputs::Local { .. } => return Ok(Progress::Idle),
        };

        let consumed = rows.len();
        for row in rows {
            self.process(row)?;
        }

        if all_ended {
            self.finish(ctx)
        } else if consumed > 0 {
            Ok(Progress::Busy)
        } else {
            Ok(Progress::Idle)
        }
    }
}

impl Task for OperatorTask {
    fn open(&mut self, ctx: &mut TaskContext) -> anyhow::Result<()> {
        match &mut self.operator {
            Operator::Transform(transform) => transform.open()?,
            Operator::Sink { writer, .. } => writer.open(self.restored.connector.as_deref())?,
        }
        if let Inputs::Intermediate { readers, .. } = &mut self.inputs {
            for reader in readers.iter_mut() {
                reader.restore(ctx.job_id, &self.restored);
            }
        }
        self.output.open(ctx.job_id, &self.restored)
    }

    fn poll(&mut self, ctx: &mut TaskContext) -> anyhow::Result<Progress> {
        if matches!(self.inputs, Inputs::Local { .. }) {
            self.poll_local(ctx)
        } else {
            self.poll_intermediate(ctx)
        }
    }

    fn handle_op(
        &mut self,
        ctx: &mut TaskContext,
        op: ControlOp,
        finished: bool,
    ) -> anyhow::Result<()> {
        match op {
            ControlOp::CheckpointBarrier(barrier) => {
                if matches!(self.inputs, Inputs::Local { .. }) {
                    warn!(
                        "{} receives barriers in band, ignore {}",
                        ctx.task_name, barrier.checkpoint_id
                    );
                } else if !finished {
                    self.checkpoint(ctx, barrier)?;
                }
            }
            ControlOp::NotifyCheckpointComplete(checkpoint_id) => {
                if let Operator::Sink { writer, commits } = &mut self.operator {
                    let later = commits.split_off(&checkpoint_id.next());
                    for (id, info) in std::mem::replace(commits, later) {
                        debug!("{} commit {}", ctx.task_name, id);
                        writer.notify_checkpoint_complete(id, info.as_deref())?;
                    }
                }
            }
            op => warn!("{} ignore unexpected {:?}", ctx.task_name, op),
        }
        Ok(())
    }

    fn snapshot(
        &mut self,
        _ctx: &TaskContext,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<TaskSnapshot> {
        let connector = match &mut self.operator {
            Operator::Sink { writer, .. } => Some(writer.snapshot_state(checkpoint_id)?),
            Operator::Transform(_) => None,
        };
        let input_offsets = match &self.inputs {
            Inputs::Intermediate { readers, .. } => readers.iter().map(|r| r.offset()).collect(),
            Inputs::Local { .. } => vec![],
        };
        Ok(TaskSnapshot {
            connector,
            enumerator: None,
            input_offsets,
            output_written: self.output.written(),
        })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        match &mut self.operator {
            Operator::Transform(transform) => transform.close(),
            Operator::Sink { writer, .. } => writer.close(),
        }
    }
}
