use std::path::PathBuf;

use crate::api::checkpoint::CompletedCheckpoint;
use crate::api::runtime::{CheckpointId, JobId, PipelineId};
use crate::storage::checkpoint::CheckpointStorage;
use crate::utils::fs::{read_binary, write_atomic};

const FILE_PREFIX: &'static str = "ck-";
const FILE_SUFFIX: &'static str = ".json";

/// One JSON file per checkpoint under `{dir}/{job}/{pipeline}/ck-{id}.json`. Files are
/// written to a temporary name and renamed, so a crash never leaves a torn checkpoint.
#[derive(Debug)]
pub struct FileCheckpointStorage {
    dir: PathBuf,
}

impl FileCheckpointStorage {
    pub fn new(dir: &str) -> anyhow::Result<Self> {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow!("create checkpoint dir {:?} error. {}", dir, e))?;
        Ok(FileCheckpointStorage { dir })
    }

    fn pipeline_dir(&self, job_id: JobId, pipeline_id: PipelineId) -> PathBuf {
        self.dir
            .join(job_id.to_string())
            .join(pipeline_id.to_string())
    }

    fn checkpoint_ids(
        &self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> anyhow::Result<Vec<CheckpointId>> {
        let dir = self.pipeline_dir(job_id, pipeline_id);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let file_name = entry?.file_name();
            let file_name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if !file_name.starts_with(FILE_PREFIX) || !file_name.ends_with(FILE_SUFFIX) {
                continue;
            }

            let id = &file_name[FILE_PREFIX.len()..file_name.len() - FILE_SUFFIX.len()];
            match id.parse::<u64>() {
                Ok(id) => ids.push(CheckpointId(id)),
                Err(_) => warn!("skip unrecognized checkpoint file {:?}", dir.join(file_name)),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn file_name(checkpoint_id: CheckpointId) -> String {
        format!("{}{}{}", FILE_PREFIX, checkpoint_id.0, FILE_SUFFIX)
    }
}

impl CheckpointStorage for FileCheckpointStorage {
    fn save(&mut self, checkpoint: &CompletedCheckpoint) -> anyhow::Result<()> {
        let dir = self.pipeline_dir(checkpoint.job_id, checkpoint.pipeline_id);
        std::fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec(checkpoint)?;
        let path = write_atomic(
            dir.as_path(),
            Self::file_name(checkpoint.checkpoint_id).as_str(),
            bytes.as_slice(),
        )?;
        debug!("checkpoint saved to {:?}", path);
        Ok(())
    }

    fn load_latest(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
    ) -> anyhow::Result<Option<CompletedCheckpoint>> {
        let latest = match self.checkpoint_ids(job_id, pipeline_id)?.last() {
            Some(id) => *id,
            None => return Ok(None),
        };

        let path = self
            .pipeline_dir(job_id, pipeline_id)
            .join(Self::file_name(latest));
        let bytes = read_binary(path.as_path())?;
        let checkpoint: CompletedCheckpoint = serde_json::from_slice(bytes.as_slice())
            .map_err(|e| anyhow!("parse checkpoint file {:?} error. {}", path, e))?;
        Ok(Some(checkpoint))
    }

    fn retire(
        &mut self,
        job_id: JobId,
        pipeline_id: PipelineId,
        checkpoint_id: CheckpointId,
    ) -> anyhow::Result<usize> {
        let dir = self.pipeline_dir(job_id, pipeline_id);
        let mut removed = 0;
        for id in self.checkpoint_ids(job_id, pipeline_id)? {
            if id >= checkpoint_id {
                continue;
            }
            std::fs::remove_file(dir.join(Self::file_name(id)))?;
            removed += 1;
        }
        Ok(removed)
    }
}
