//! Data paths of a task: in-group channels and intermediate datasets across pipeline
//! boundaries.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::api::checkpoint::CheckpointBarrier;
use crate::api::connector::Collector;
use crate::api::element::{Element, Row};
use crate::api::runtime::JobId;
use crate::channel::ElementSender;
use crate::metrics::metric::Counter;
use crate::runtime::intermediate::{IntermediateStore, PartitionSelector, ReadResult};
use crate::runtime::wire::{IntermediateInput, IntermediateOutput};
use crate::runtime::worker::task::{InputOffset, OutputWritten, TaskSnapshot};

pub(crate) const READ_BATCH: usize = 256;

struct IntermediateWriter {
    output: IntermediateOutput,
    selector: PartitionSelector,
    written: u64,
}

/// Fan-out of a task's rows to every downstream consumer.
pub(crate) struct Output {
    producer: u32,
    local: Vec<ElementSender>,
    intermediate: Vec<IntermediateWriter>,
    store: Arc<IntermediateStore>,
    running: Arc<AtomicBool>,
    rows_out: Counter,
}

impl Output {
    pub fn new(
        producer: u32,
        local: Vec<ElementSender>,
        intermediate: Vec<IntermediateOutput>,
        store: Arc<IntermediateStore>,
        running: Arc<AtomicBool>,
        rows_out: Counter,
    ) -> Self {
        let intermediate = intermediate
            .into_iter()
            .map(|output| IntermediateWriter {
                selector: PartitionSelector::new(
                    output.partitioner.clone(),
                    output.partitions,
                    producer,
                ),
                output,
                written: 0,
            })
            .collect();
        Output {
            producer,
            local,
            intermediate,
            store,
            running,
            rows_out,
        }
    }

    /// Rows a blocking dataset holds beyond the restored snapshot were never seen by a
    /// consumer and are dropped; a pipelined dataset is only reopened.
    pub fn open(&mut self, job_id: JobId, restored: &TaskSnapshot) -> anyhow::Result<()> {
        for writer in self.intermediate.iter_mut() {
            let dataset = writer.output.dataset;
            if writer.output.blocking {
                let written = restored.restore_written(job_id, &dataset);
                let removed = self
                    .store
                    .truncate_producer(&dataset, self.producer, written)?;
                if removed > 0 {
                    info!(
                        "drop {} rows of producer {} in {} beyond the restored snapshot",
                        removed, self.producer, dataset
                    );
                }
                writer.written = written;
            } else {
                self.store.reopen_producer(&dataset, self.producer)?;
                writer.written = restored.restore_written(job_id, &dataset);
            }
        }
        Ok(())
    }

    pub fn emit(&mut self, row: Row) -> anyhow::Result<()> {
        self.rows_out.fetch_add(1);
        for writer in self.intermediate.iter_mut() {
            let partition = writer.selector.select(&row)?;
            writer.written =
                self.store
                    .append(&writer.output.dataset, self.producer, partition, row.clone())?;
        }

        if let Some((last, others)) = self.local.split_last() {
            for sender in others {
                sender.send(Element::Record(row.clone()), self.running.as_ref())?;
            }
            last.send(Element::Record(row), self.running.as_ref())?;
        }
        Ok(())
    }

    /// Barriers travel only over in-group channels; a boundary is cut by the written
    /// counts in the snapshot instead.
    pub fn barrier(&self, barrier: CheckpointBarrier) -> anyhow::Result<()> {
        for sender in &self.local {
            sender.send(Element::Barrier(barrier), self.running.as_ref())?;
        }
        Ok(())
    }

    pub fn end(&mut self) -> anyhow::Result<()> {
        for sender in &self.local {
            sender.send(Element::End, self.running.as_ref())?;
        }
        for writer in &self.intermediate {
            self.store
                .close_producer(&writer.output.dataset, self.producer)?;
        }
        Ok(())
    }

    pub fn written(&self) -> Vec<OutputWritten> {
        self.intermediate
            .iter()
            .map(|w| OutputWritten {
                dataset: w.output.dataset,
                written: w.written,
            })
            .collect()
    }
}

impl Collector for Output {
    fn collect(&mut self, row: Row) -> anyhow::Result<()> {
        self.emit(row)
    }
}

/// Consumer cursor on one partition of an intermediate dataset.
#[derive(Debug)]
pub(crate) struct IntermediateReader {
    input: IntermediateInput,
    offset: u64,
    ended: bool,
}

impl IntermediateReader {
    pub fn new(input: IntermediateInput) -> Self {
        IntermediateReader {
            input,
            offset: 0,
            ended: false,
        }
    }

    pub fn restore(&mut self, job_id: JobId, restored: &TaskSnapshot) {
        self.offset = restored.restore_offset(job_id, &self.input.dataset, self.input.partition);
        if self.offset > 0 {
            info!(
                "resume {} partition {} from offset {}",
                self.input.dataset, self.input.partition, self.offset
            );
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn read(&mut self, store: &IntermediateStore) -> anyhow::Result<ReadResult> {
        let result = store.read(
            &self.input.dataset,
            self.input.partition,
            self.offset as usize,
            READ_BATCH,
        )?;
        self.offset += result.rows.len() as u64;
        self.ended = result.end;
        Ok(result)
    }

    pub fn offset(&self) -> InputOffset {
        InputOffset {
            dataset: self.input.dataset,
            partition: self.input.partition,
            offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::api::config::Partitioner;
    use crate::api::element::{Element, Row};
    use crate::api::runtime::{JobId, VertexId};
    use crate::channel::named_channel;
    use crate::metrics::metric::Counter;
    use crate::runtime::intermediate::{DatasetId, IntermediateStore};
    use crate::runtime::wire::{IntermediateInput, IntermediateOutput};
    use crate::runtime::worker::io::{IntermediateReader, Output};
    use crate::runtime::worker::task::{OutputWritten, TaskSnapshot};

    fn dataset() -> DatasetId {
        DatasetId {
            job_id: JobId(1),
            input_vertex_id: VertexId(1),
            target_vertex_id: VertexId(2),
        }
    }

    fn output(store: &Arc<IntermediateStore>, blocking: bool) -> (Output, crate::channel::ElementReceiver) {
        let (sender, receiver) = named_channel("io_test", vec![], 16);
        let output = Output::new(
            0,
            vec![sender],
            vec![IntermediateOutput {
                dataset: dataset(),
                partitions: 2,
                partitioner: Partitioner::RoundRobin,
                blocking,
            }],
            store.clone(),
            Arc::new(AtomicBool::new(true)),
            Counter::default(),
        );
        (output, receiver)
    }

    #[test]
    pub fn fan_out_and_read_back_test() {
        let store = Arc::new(IntermediateStore::new());
        store.register(dataset(), 2, 1);
        let (mut output, receiver) = output(&store, true);
        output.open(JobId(1), &TaskSnapshot::default()).unwrap();

        for i in 0..4 {
            output.emit(Row::new(vec![json!(i)])).unwrap();
        }
        output.end().unwrap();
        assert_eq!(output.written()[0].written, 4);

        let mut elements = vec![];
        while let Ok(e) = receiver.recv_timeout(Duration::from_millis(10)) {
            elements.push(e);
        }
        assert_eq!(elements.len(), 5);
        assert_eq!(elements[4], Element::End);

        let mut reader = IntermediateReader::new(IntermediateInput {
            dataset: dataset(),
            partition: 1,
        });
        let result = reader.read(store.as_ref()).unwrap();
        assert_eq!(result.rows, vec![Row::new(vec![json!(1)]), Row::new(vec![json!(3)])]);
        assert!(reader.is_ended());
        assert_eq!(reader.offset().offset, 2);
    }

    #[test]
    pub fn blocking_restore_truncates_test() {
        let store = Arc::new(IntermediateStore::new());
        store.register(dataset(), 2, 1);
        {
            let (mut output, _receiver) = output(&store, true);
            output.open(JobId(1), &TaskSnapshot::default()).unwrap();
            for i in 0..6 {
                output.emit(Row::new(vec![json!(i)])).unwrap();
            }
        }

        // the restarted producer resumes after its 2nd row
        let restored = TaskSnapshot {
            output_written: vec![OutputWritten {
                dataset: dataset(),
                written: 2,
            }],
            ..Default::default()
        };
        let (mut output, _receiver) = output(&store, true);
        output.open(JobId(1), &restored).unwrap();
        assert_eq!(store.partition_len(&dataset(), 0) + store.partition_len(&dataset(), 1), 2);
        output.emit(Row::new(vec![json!(2)])).unwrap();
        assert_eq!(output.written()[0].written, 3);
    }
}
