use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;

use crate::api::connector::{
    Boundedness, Collector, PollStatus, SourceConnector, SourceReader, SplitAssignContext,
    SplitEnumerator, SubtaskContext,
};
use crate::api::element::Row;
use crate::api::properties::Properties;
use crate::api::runtime::CheckpointId;
use crate::api::split::SourceSplit;
use crate::functions::get_u64_or;

/// total number of generated rows
pub const ROWS: &str = "rows";
/// number of splits the rows are cut into, defaults to the source parallelism
pub const SPLITS: &str = "splits";
pub const ROWS_PER_POLL: &str = "rows.per.poll";
/// `false` keeps the readers alive after the last row
pub const BOUNDED: &str = "bounded";

const SPLIT_NUMBER: &str = "number";
const SPLIT_START: &str = "start";
const SPLIT_END: &str = "end";

/// The n-th generated row: `[n, "row-n"]`.
pub fn vec_row(n: u64) -> Row {
    Row::new(vec![Value::from(n), Value::from(format!("row-{}", n))])
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
struct SplitState {
    number: u64,
    split_id: String,
    start: u64,
    end: u64,
    offset: u64,
}

impl SplitState {
    fn to_split(&self) -> SourceSplit {
        let mut properties = Properties::new();
        properties.set_u64(SPLIT_NUMBER, self.number);
        properties.set_u64(SPLIT_START, self.offset);
        properties.set_u64(SPLIT_END, self.end);
        SourceSplit::new(self.split_id.as_str(), properties)
    }

    fn from_split(split: &SourceSplit) -> anyhow::Result<Self> {
        let properties = split.properties();
        let start = properties
            .get_u64(SPLIT_START)
            .map_err(|e| anyhow!("split {}: {}", split.split_id(), e))?;
        let end = properties
            .get_u64(SPLIT_END)
            .map_err(|e| anyhow!("split {}: {}", split.split_id(), e))?;
        Ok(SplitState {
            number: get_u64_or(properties, SPLIT_NUMBER, 0)?,
            split_id: split.split_id().to_string(),
            start,
            end,
            offset: start,
        })
    }
}

/// Generates `rows` sequential rows cut into contiguous splits.
#[derive(Clone, Debug)]
pub struct VecSource {
    rows: u64,
    splits: Option<u64>,
    rows_per_poll: u64,
    bounded: bool,
}

impl Default for VecSource {
    fn default() -> Self {
        VecSource {
            rows: 100,
            splits: None,
            rows_per_poll: 16,
            bounded: true,
        }
    }
}

impl SourceConnector for VecSource {
    fn prepare(&mut self, config: &Properties) -> anyhow::Result<()> {
        self.rows = get_u64_or(config, ROWS, self.rows)?;
        if config.contains_key(SPLITS) {
            let splits = get_u64_or(config, SPLITS, 1)?;
            if splits == 0 {
                return Err(anyhow!("property `{}` must be positive", SPLITS));
            }
            self.splits = Some(splits);
        }
        self.rows_per_poll = get_u64_or(config, ROWS_PER_POLL, self.rows_per_poll)?.max(1);
        self.bounded = match config.get_str_or(BOUNDED, "true") {
            "true" => true,
            "false" => false,
            v => return Err(anyhow!("property `{}`: expect true|false, got {}", BOUNDED, v)),
        };
        Ok(())
    }

    fn boundedness(&self) -> Boundedness {
        if self.bounded {
            Boundedness::Bounded
        } else {
            Boundedness::Unbounded
        }
    }

    fn create_reader(&self, context: &SubtaskContext) -> anyhow::Result<Box<dyn SourceReader>> {
        Ok(Box::new(VecSourceReader {
            context: context.clone(),
            rows_per_poll: self.rows_per_poll,
            bounded: self.bounded,
            splits: VecDeque::new(),
            no_more_splits: false,
        }))
    }

    fn create_split_enumerator(
        &self,
        _context: &SubtaskContext,
    ) -> anyhow::Result<Box<dyn SplitEnumerator>> {
        Ok(Box::new(VecSplitEnumerator {
            rows: self.rows,
            splits: self.splits,
            state: EnumeratorState::default(),
        }))
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
struct ReaderState {
    splits: Vec<SplitState>,
    no_more_splits: bool,
}

pub struct VecSourceReader {
    context: SubtaskContext,
    rows_per_poll: u64,
    bounded: bool,
    splits: VecDeque<SplitState>,
    no_more_splits: bool,
}

impl SourceReader for VecSourceReader {
    fn open(&mut self, restored: Option<&[u8]>) -> anyhow::Result<()> {
        if let Some(bytes) = restored {
            let state: ReaderState = serde_json::from_slice(bytes)?;
            info!(
                "{}-{} restore {} splits",
                self.context.vertex_id,
                self.context.subtask_index,
                state.splits.len()
            );
            self.splits = state.splits.into_iter().collect();
            self.no_more_splits = state.no_more_splits;
        }
        Ok(())
    }

    fn add_splits(&mut self, splits: Vec<SourceSplit>) {
        for split in splits {
            match SplitState::from_split(&split) {
                Ok(state) => self.splits.push_back(state),
                Err(e) => error!("drop malformed split. {}", e),
            }
        }
    }

    fn handle_no_more_splits(&mut self) {
        self.no_more_splits = true;
    }

    fn poll_next(&mut self, output: &mut dyn Collector) -> anyhow::Result<PollStatus> {
        let split = match self.splits.front_mut() {
            Some(split) => split,
            None => {
                return Ok(if self.no_more_splits && self.bounded {
                    PollStatus::End
                } else {
                    PollStatus::NothingAvailable
                });
            }
        };

        let end = split.end.min(split.offset + self.rows_per_poll);
        while split.offset < end {
            output.collect(vec_row(split.offset))?;
            split.offset += 1;
        }
        if split.offset >= split.end {
            debug!("{} exhausted", split.split_id);
            self.splits.pop_front();
        }
        Ok(PollStatus::MoreAvailable)
    }

    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>> {
        let state = ReaderState {
            splits: self.splits.iter().cloned().collect(),
            no_more_splits: self.no_more_splits,
        };
        Ok(serde_json::to_vec(&state)?)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
struct EnumeratorState {
    initialized: bool,
    pending: Vec<SplitState>,
}

/// Cuts the rows into splits once and hands split `n` to reader `n % parallelism`.
pub struct VecSplitEnumerator {
    rows: u64,
    splits: Option<u64>,
    state: EnumeratorState,
}

impl VecSplitEnumerator {
    fn init_splits(&mut self, parallelism: u32) {
        let count = self.splits.unwrap_or(parallelism as u64).max(1);
        self.state.pending = (0..count)
            .map(|n| {
                let start = self.rows * n / count;
                SplitState {
                    number: n,
                    split_id: format!("split-{}", n),
                    start,
                    end: self.rows * (n + 1) / count,
                    offset: start,
                }
            })
            .collect();
        self.state.initialized = true;
    }
}

impl SplitEnumerator for VecSplitEnumerator {
    fn open(&mut self, restored: Option<&[u8]>) -> anyhow::Result<()> {
        if let Some(bytes) = restored {
            self.state = serde_json::from_slice(bytes)?;
        }
        Ok(())
    }

    fn run(&mut self, context: &mut dyn SplitAssignContext) -> anyhow::Result<()> {
        let parallelism = context.parallelism().max(1);
        if !self.state.initialized {
            self.init_splits(parallelism);
        }

        let mut assignments: BTreeMap<u32, Vec<SourceSplit>> = BTreeMap::new();
        for split in &self.state.pending {
            let owner = (split.number % parallelism as u64) as u32;
            assignments.entry(owner).or_default().push(split.to_split());
        }
        for (subtask_index, splits) in assignments {
            context.assign_splits(subtask_index, splits)?;
        }
        self.state.pending.clear();

        for subtask_index in 0..parallelism {
            context.signal_no_more_splits(subtask_index)?;
        }
        Ok(())
    }

    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::api::connector::{
        Boundedness, PollStatus, SourceConnector, SplitAssignContext, SubtaskContext,
    };
    use crate::api::element::Row;
    use crate::api::properties::Properties;
    use crate::api::runtime::{CheckpointId, JobId, VertexId};
    use crate::api::split::SourceSplit;
    use crate::functions::source::vec_source::{vec_row, VecSource, BOUNDED, ROWS, SPLITS};

    #[derive(Default)]
    struct RecordingContext {
        parallelism: u32,
        assigned: HashMap<u32, Vec<SourceSplit>>,
        no_more: Vec<u32>,
    }

    impl SplitAssignContext for RecordingContext {
        fn parallelism(&self) -> u32 {
            self.parallelism
        }

        fn assign_splits(
            &mut self,
            subtask_index: u32,
            splits: Vec<SourceSplit>,
        ) -> anyhow::Result<()> {
            self.assigned.entry(subtask_index).or_default().extend(splits);
            Ok(())
        }

        fn signal_no_more_splits(&mut self, subtask_index: u32) -> anyhow::Result<()> {
            self.no_more.push(subtask_index);
            Ok(())
        }
    }

    fn subtask(index: u32, parallelism: u32) -> SubtaskContext {
        SubtaskContext {
            job_id: JobId(1),
            vertex_id: VertexId(1),
            subtask_index: index,
            parallelism,
        }
    }

    fn source(rows: u64, splits: u64) -> VecSource {
        let mut properties = Properties::new();
        properties.set_u64(ROWS, rows);
        properties.set_u64(SPLITS, splits);
        let mut source = VecSource::default();
        source.prepare(&properties).unwrap();
        source
    }

    #[test]
    pub fn enumerator_assign_test() {
        let source = source(10, 3);
        let mut enumerator = source.create_split_enumerator(&subtask(0, 1)).unwrap();
        enumerator.open(None).unwrap();

        let mut context = RecordingContext {
            parallelism: 2,
            ..Default::default()
        };
        enumerator.run(&mut context).unwrap();

        let ids: Vec<&str> = context.assigned[&0].iter().map(|s| s.split_id()).collect();
        assert_eq!(ids, vec!["split-0", "split-2"]);
        assert_eq!(context.assigned[&1].len(), 1);
        assert_eq!(context.no_more, vec![0, 1]);

        // nothing is handed out twice after a restore
        let state = enumerator.snapshot_state(CheckpointId(1)).unwrap();
        let mut restored = source.create_split_enumerator(&subtask(0, 1)).unwrap();
        restored.open(Some(state.as_slice())).unwrap();
        let mut context = RecordingContext {
            parallelism: 2,
            ..Default::default()
        };
        restored.run(&mut context).unwrap();
        assert!(context.assigned.is_empty());
        assert_eq!(context.no_more, vec![0, 1]);
    }

    #[test]
    pub fn reader_restore_test() {
        let source = source(40, 1);
        let mut enumerator = source.create_split_enumerator(&subtask(0, 1)).unwrap();
        let mut context = RecordingContext {
            parallelism: 1,
            ..Default::default()
        };
        enumerator.run(&mut context).unwrap();

        let mut reader = source.create_reader(&subtask(0, 1)).unwrap();
        reader.open(None).unwrap();
        reader.add_splits(context.assigned.remove(&0).unwrap());
        reader.handle_no_more_splits();

        let mut rows: Vec<Row> = Vec::new();
        assert_eq!(reader.poll_next(&mut rows).unwrap(), PollStatus::MoreAvailable);
        assert_eq!(rows.len(), 16);
        let state = reader.snapshot_state(CheckpointId(1)).unwrap();

        let mut reader = source.create_reader(&subtask(0, 1)).unwrap();
        reader.open(Some(state.as_slice())).unwrap();
        let mut rest: Vec<Row> = Vec::new();
        while reader.poll_next(&mut rest).unwrap() != PollStatus::End {}
        assert_eq!(rest.len(), 24);
        assert_eq!(rest[0], vec_row(16));
        assert_eq!(rest[23], vec_row(39));
    }

    #[test]
    pub fn unbounded_reader_test() {
        let mut properties = Properties::new();
        properties.set_u64(ROWS, 0);
        properties.set_str(BOUNDED, "false");
        let mut source = VecSource::default();
        source.prepare(&properties).unwrap();
        assert_eq!(source.boundedness(), Boundedness::Unbounded);

        let mut reader = source.create_reader(&subtask(0, 1)).unwrap();
        reader.handle_no_more_splits();
        let mut rows: Vec<Row> = Vec::new();
        assert_eq!(
            reader.poll_next(&mut rows).unwrap(),
            PollStatus::NothingAvailable
        );

        properties.set_str(BOUNDED, "maybe");
        assert!(VecSource::default().prepare(&properties).is_err());
    }
}
