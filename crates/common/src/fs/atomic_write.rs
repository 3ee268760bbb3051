//! Durable record writes: flock + temp file + fsync + atomic rename.
//!
//! Readers never observe a half-written record because the final path is
//! only ever replaced by `rename`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

/// Exclusive advisory lock on `<record>.lock`, released on drop.
///
/// Holding the lock gives single-writer access to the record for a whole
/// read-modify-write cycle.
pub struct RecordLock {
    file: File,
    path: PathBuf,
    record: PathBuf,
}

impl RecordLock {
    pub fn acquire(record: &Path) -> io::Result<Self> {
        let path = sibling(record, "lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path,
            record: record.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the guarded record without re-acquiring the lock.
    pub fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(value).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialise {}: {}", self.record.display(), err),
            )
        })?;
        replace_file(&self.record, &body)
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    RecordLock::acquire(path)?.write_json(value)
}

fn replace_file(path: &Path, body: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let temp_path = sibling(path, "tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);

    let mut temp = options.open(&temp_path)?;
    temp.write_all(body)?;
    temp.sync_all()?;
    drop(temp);

    fs::rename(&temp_path, path)?;

    #[cfg(target_family = "unix")]
    {
        let dir_handle = File::open(dir)?;
        dir_handle.sync_all()?;
    }

    Ok(())
}

/// Read a JSON record. A missing file is `Ok(None)`; a corrupt one is an
/// `InvalidData` error naming the path.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let value = serde_json::from_reader(io::BufReader::new(file)).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse {}: {}", path.display(), err),
        )
    })?;
    Ok(Some(value))
}
