use std::fs::{DirBuilder, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write `bytes` to `dir/file_name` through a temporary file and a rename, so readers
/// never observe a half written file.
pub fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    DirBuilder::new().recursive(true).create(dir)?;

    let path = dir.join(file_name);
    let tmp_path = dir.join(format!(".{}.tmp", file_name));

    let mut output = File::create(&tmp_path)?;
    output.write_all(bytes)?;
    output.sync_all()?;
    std::fs::rename(&tmp_path, &path)?;

    Ok(path)
}

pub fn read_binary(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

pub fn read_string(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}
