use crate::memory::MemoryHistoryStore;
use crate::store::{HistoryResult, HistoryStore, HistoryStoreError};
use crate::types::{HistoryEntry, HistoryRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// History store that writes one JSON record per line.
///
/// Each append is written through to the file before it is acknowledged;
/// [`HistoryStore::flush`] additionally syncs the file to disk. A record
/// whose line cannot be written is not kept in memory either, so the file
/// and [`HistoryStore::records`] never disagree.
#[derive(Clone, Debug)]
pub struct JsonlHistoryStore {
    path: PathBuf,
    inner: MemoryHistoryStore,
    writer: Arc<Mutex<LineWriter>>,
}

#[derive(Debug)]
struct LineWriter {
    file: File,
    committed_len: u64,
}

impl LineWriter {
    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self.file.write_all(line).and_then(|_| self.file.flush()) {
            Ok(()) => {
                self.committed_len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                // Cut any partial line so the file still ends on a record.
                let _ = self.file.set_len(self.committed_len);
                let _ = self.file.seek(SeekFrom::Start(self.committed_len));
                Err(err)
            }
        }
    }
}

impl JsonlHistoryStore {
    /// Creates a fresh history file. An existing non-empty file is never
    /// overwritten.
    pub fn create<P: AsRef<Path>>(path: P) -> HistoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                HistoryStoreError::Backend(format!("create history directory failed: {err}"))
            })?;
        }
        if fs::metadata(&path).is_ok_and(|meta| meta.len() > 0) {
            return Err(HistoryStoreError::Conflict(format!(
                "history file '{}' already exists",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| HistoryStoreError::Backend(format!("open history file failed: {err}")))?;

        Ok(Self {
            path,
            inner: MemoryHistoryStore::new(),
            writer: Arc::new(Mutex::new(LineWriter {
                file,
                committed_len: 0,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_writer(&self) -> HistoryResult<std::sync::MutexGuard<'_, LineWriter>> {
        self.writer
            .lock()
            .map_err(|_| HistoryStoreError::Backend("history writer mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, turn: u32, entry: HistoryEntry) -> HistoryResult<HistoryRecord> {
        let mut writer = self.lock_writer()?;
        self.inner.append_with(turn, entry, |record| {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            writer.write_line(&line).map_err(|err| {
                HistoryStoreError::Backend(format!("write history record failed: {err}"))
            })
        })
    }

    async fn records(&self) -> HistoryResult<Vec<HistoryRecord>> {
        self.inner.snapshot()
    }

    async fn len(&self) -> HistoryResult<usize> {
        self.inner.len().await
    }

    async fn flush(&self) -> HistoryResult<()> {
        let writer = self.lock_writer()?;
        writer
            .file
            .sync_data()
            .map_err(|err| HistoryStoreError::Backend(format!("sync history file failed: {err}")))
    }
}
