//! Data crossing a pipeline boundary. Every dataset is partitioned by consumer subtask
//! and kept append-only, so a restarted consumer re-reads from its checkpointed offset.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::api::config::Partitioner;
use crate::api::element::Row;
use crate::api::runtime::{JobId, VertexId};
use crate::utils::hash::hash_code;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DatasetId {
    pub job_id: JobId,
    pub input_vertex_id: VertexId,
    pub target_vertex_id: VertexId,
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.job_id, self.input_vertex_id, self.target_vertex_id
        )
    }
}

#[derive(Debug)]
struct Entry {
    producer: u32,
    seq: u64,
    row: Row,
}

#[derive(Debug)]
struct Dataset {
    partitions: Vec<Vec<Entry>>,
    producers: u32,
    closed_producers: BTreeSet<u32>,
    /// rows appended so far, by producer subtask
    written: HashMap<u32, u64>,
}

impl Dataset {
    fn is_closed(&self) -> bool {
        self.closed_producers.len() as u32 >= self.producers
    }
}

#[derive(Debug, PartialEq)]
pub struct ReadResult {
    pub rows: Vec<Row>,
    /// every producer closed and the partition is drained up to the returned rows
    pub end: bool,
}

#[derive(Debug, Default)]
pub struct IntermediateStore {
    datasets: DashMap<DatasetId, Arc<RwLock<Dataset>>>,
}

impl IntermediateStore {
    pub fn new() -> Self {
        IntermediateStore::default()
    }

    /// Create-if-absent; producers and consumers may register in any order.
    pub fn register(&self, dataset_id: DatasetId, partitions: u32, producers: u32) {
        self.datasets.entry(dataset_id).or_insert_with(|| {
            debug!(
                "register intermediate dataset {} with {} partitions and {} producers",
                dataset_id, partitions, producers
            );
            Arc::new(RwLock::new(Dataset {
                partitions: (0..partitions).map(|_| Vec::new()).collect(),
                producers,
                closed_producers: BTreeSet::new(),
                written: HashMap::new(),
            }))
        });
    }

    fn dataset(&self, dataset_id: &DatasetId) -> anyhow::Result<Arc<RwLock<Dataset>>> {
        self.datasets
            .get(dataset_id)
            .map(|x| x.value().clone())
            .ok_or_else(|| anyhow!("intermediate dataset {} not registered", dataset_id))
    }

    /// Returns the number of rows `producer` has appended, this one included.
    pub fn append(
        &self,
        dataset_id: &DatasetId,
        producer: u32,
        partition: u32,
        row: Row,
    ) -> anyhow::Result<u64> {
        let dataset = self.dataset(dataset_id)?;
        let mut dataset = write_lock!(dataset, "intermediate dataset")?;
        let partitions = dataset.partitions.len();
        if partition as usize >= partitions {
            return Err(anyhow!("partition {} out of {}", partition, partitions));
        }

        let written = dataset.written.entry(producer).or_insert(0);
        let seq = *written;
        *written += 1;
        dataset.partitions[partition as usize].push(Entry { producer, seq, row });
        Ok(seq + 1)
    }

    pub fn close_producer(&self, dataset_id: &DatasetId, producer_subtask: u32) -> anyhow::Result<()> {
        let dataset = self.dataset(dataset_id)?;
        let mut dataset = write_lock!(dataset, "intermediate dataset")?;
        dataset.closed_producers.insert(producer_subtask);
        Ok(())
    }

    /// A restarted producer writes again, the dataset is no longer complete.
    pub fn reopen_producer(&self, dataset_id: &DatasetId, producer_subtask: u32) -> anyhow::Result<()> {
        let dataset = self.dataset(dataset_id)?;
        let mut dataset = write_lock!(dataset, "intermediate dataset")?;
        dataset.closed_producers.remove(&producer_subtask);
        Ok(())
    }

    /// Drop the rows `producer_subtask` appended after its first `written` rows. Only safe
    /// while no consumer has read the dataset.
    pub fn truncate_producer(
        &self,
        dataset_id: &DatasetId,
        producer_subtask: u32,
        written: u64,
    ) -> anyhow::Result<usize> {
        let dataset = self.dataset(dataset_id)?;
        let mut dataset = write_lock!(dataset, "intermediate dataset")?;
        let mut removed = 0;
        for partition in dataset.partitions.iter_mut() {
            let before = partition.len();
            partition.retain(|e| e.producer != producer_subtask || e.seq < written);
            removed += before - partition.len();
        }
        dataset.written.insert(producer_subtask, written);
        Ok(removed)
    }

    pub fn read(
        &self,
        dataset_id: &DatasetId,
        partition: u32,
        offset: usize,
        max_rows: usize,
    ) -> anyhow::Result<ReadResult> {
        let dataset = self.dataset(dataset_id)?;
        let dataset = read_lock!(dataset, "intermediate dataset")?;
        let rows = dataset
            .partitions
            .get(partition as usize)
            .ok_or_else(|| anyhow!("partition {} not found in {}", partition, dataset_id))?;

        let begin = offset.min(rows.len());
        let end = (begin + max_rows).min(rows.len());
        Ok(ReadResult {
            rows: rows[begin..end].iter().map(|e| e.row.clone()).collect(),
            end: dataset.is_closed() && end == rows.len(),
        })
    }

    pub fn partition_len(&self, dataset_id: &DatasetId, partition: u32) -> usize {
        match self.dataset(dataset_id) {
            Ok(dataset) => match dataset.read() {
                Ok(dataset) => dataset
                    .partitions
                    .get(partition as usize)
                    .map(|x| x.len())
                    .unwrap_or(0),
                Err(_) => 0,
            },
            Err(_) => 0,
        }
    }

    pub fn drop_job(&self, job_id: JobId) {
        self.datasets.retain(|id, _| id.job_id != job_id);
    }
}

/// Producer side routing of rows to consumer partitions.
#[derive(Debug)]
pub struct PartitionSelector {
    partitioner: Partitioner,
    partitions: u32,
    next: u32,
}

impl PartitionSelector {
    pub fn new(partitioner: Partitioner, partitions: u32, start: u32) -> Self {
        PartitionSelector {
            partitioner,
            partitions: partitions.max(1),
            next: start,
        }
    }

    pub fn select(&mut self, row: &Row) -> anyhow::Result<u32> {
        match &self.partitioner {
            Partitioner::RoundRobin => {
                let p = self.next % self.partitions;
                self.next = self.next.wrapping_add(1);
                Ok(p)
            }
            Partitioner::Hash { field } => {
                let value = row
                    .field(*field)
                    .ok_or_else(|| anyhow!("hash field {} not found in row", field))?;
                let code = hash_code(value.to_string().as_bytes())?;
                Ok(code % self.partitions)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::api::config::Partitioner;
    use crate::api::element::Row;
    use crate::api::runtime::{JobId, VertexId};
    use crate::runtime::intermediate::{DatasetId, IntermediateStore, PartitionSelector};

    fn dataset_id() -> DatasetId {
        DatasetId {
            job_id: JobId(1),
            input_vertex_id: VertexId(1),
            target_vertex_id: VertexId(2),
        }
    }

    #[test]
    pub fn read_until_closed_test() {
        let store = IntermediateStore::new();
        let id = dataset_id();
        store.register(id, 2, 2);
        store.append(&id, 0, 1, Row::new(vec![json!(1)])).unwrap();
        assert_eq!(store.append(&id, 0, 1, Row::new(vec![json!(2)])).unwrap(), 2);

        let r = store.read(&id, 1, 0, 1).unwrap();
        assert_eq!(r.rows.len(), 1);
        assert!(!r.end);

        store.close_producer(&id, 0).unwrap();
        store.close_producer(&id, 1).unwrap();
        let r = store.read(&id, 1, 1, 10).unwrap();
        assert_eq!(r.rows, vec![Row::new(vec![json!(2)])]);
        assert!(r.end);

        // re-enumerable from any offset
        assert_eq!(store.read(&id, 1, 0, 10).unwrap().rows.len(), 2);
        assert!(store.read(&id, 0, 0, 10).unwrap().end);

        store.reopen_producer(&id, 1).unwrap();
        assert!(!store.read(&id, 0, 0, 10).unwrap().end);

        store.drop_job(JobId(1));
        assert!(store.read(&id, 0, 0, 10).is_err());
    }

    #[test]
    pub fn truncate_producer_test() {
        let store = IntermediateStore::new();
        let id = dataset_id();
        store.register(id, 2, 2);
        for i in 0..4 {
            store.append(&id, 0, i % 2, Row::new(vec![json!(i)])).unwrap();
            store.append(&id, 1, 0, Row::new(vec![json!(100 + i)])).unwrap();
        }
        assert_eq!(store.partition_len(&id, 0), 6);

        // producer 0 restored from a snapshot taken after 1 row
        assert_eq!(store.truncate_producer(&id, 0, 1).unwrap(), 3);
        assert_eq!(store.partition_len(&id, 0), 5);
        assert_eq!(store.partition_len(&id, 1), 0);
        assert_eq!(store.append(&id, 0, 1, Row::default()).unwrap(), 2);
    }

    #[test]
    pub fn partition_selector_test() {
        let mut rr = PartitionSelector::new(Partitioner::RoundRobin, 3, 1);
        let row = Row::new(vec![json!("k")]);
        let picks: Vec<u32> = (0..4).map(|_| rr.select(&row).unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 0, 1]);

        let mut hash = PartitionSelector::new(Partitioner::Hash { field: 0 }, 4, 0);
        let a = hash.select(&row).unwrap();
        assert_eq!(hash.select(&row).unwrap(), a);
        assert!(a < 4);
        assert!(hash.select(&Row::default()).is_err());
    }
}
