use serde_json::Value;

use crate::api::connector::{SinkConnector, SinkWriter, SubtaskContext};
use crate::api::element::Row;
use crate::api::properties::Properties;
use crate::api::runtime::CheckpointId;

#[derive(Clone, Debug, Default)]
pub struct PrintSink {}

impl SinkConnector for PrintSink {
    fn prepare(&mut self, _config: &Properties) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_writer(&self, context: &SubtaskContext) -> anyhow::Result<Box<dyn SinkWriter>> {
        Ok(Box::new(PrintWriter {
            subtask_index: context.subtask_index,
            rows: 0,
        }))
    }
}

pub struct PrintWriter {
    subtask_index: u32,
    rows: u64,
}

pub(crate) fn format_row(row: &Row) -> String {
    row.fields
        .iter()
        .enumerate()
        .map(|(i, value)| match value {
            Value::String(s) => format!("{}:{}", i, s),
            v => format!("{}:{}", i, v),
        })
        .collect::<Vec<String>>()
        .join(", ")
}

impl SinkWriter for PrintWriter {
    fn open(&mut self, _restored: Option<&[u8]>) -> anyhow::Result<()> {
        Ok(())
    }

    fn write(&mut self, row: Row) -> anyhow::Result<()> {
        self.rows += 1;
        println!(
            "task_number: {}, row: [{}]",
            self.subtask_index,
            format_row(&row)
        );
        Ok(())
    }

    fn prepare_commit(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn snapshot_state(&mut self, _checkpoint_id: CheckpointId) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        info!("print writer {} closed after {} rows", self.subtask_index, self.rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::functions::sink::print::format_row;
    use crate::functions::source::vec_source::vec_row;

    #[test]
    pub fn format_row_test() {
        assert_eq!(format_row(&vec_row(7)), "0:7, 1:row-7");
    }
}
