//! Filesystem-backed fragment store.
//!
//! Content lives at `<root>/<journal>/<content_name>`, written through a
//! temp file then renamed, so a listed entry is always complete.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::core::{CompressionCodec, Fragment, JournalName, unix_ms};

use super::{FragmentStore, StoreError};

pub struct FileSystemStore {
    root: PathBuf,
    root_url: String,
}

impl FileSystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: Some(root.clone()),
            source,
        })?;
        let root = root.canonicalize().map_err(|source| StoreError::Io {
            path: Some(root.clone()),
            source,
        })?;
        let root_url = format!("file://{}", root.display());
        Ok(Self { root, root_url })
    }

    fn journal_dir(&self, journal: &JournalName) -> PathBuf {
        self.root.join(journal.as_str())
    }

    fn content_file(&self, fragment: &Fragment) -> PathBuf {
        self.journal_dir(&fragment.journal)
            .join(fragment.content_name())
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: Some(path.to_path_buf()),
        source,
    }
}

impl FragmentStore for FileSystemStore {
    fn root(&self) -> &str {
        &self.root_url
    }

    fn persist(&self, fragment: &Fragment, content: &[u8]) -> Result<(), StoreError> {
        if fragment.codec != CompressionCodec::None {
            return Err(StoreError::UnsupportedCodec(fragment.codec));
        }
        let path = self.content_file(fragment);
        if path.exists() {
            return Ok(());
        }
        let dir = self.journal_dir(&fragment.journal);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let temp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        fs::write(temp.path(), content).map_err(io_err(temp.path()))?;
        temp.persist(&path).map_err(|err| StoreError::Io {
            path: Some(path.clone()),
            source: err.error,
        })?;
        Ok(())
    }

    fn list(&self, journal: &JournalName) -> Result<Vec<Fragment>, StoreError> {
        let dir = self.journal_dir(journal);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: Some(dir),
                    source,
                });
            }
        };

        let mut fragments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(mut fragment) = Fragment::parse_content_name(journal, name) else {
                // Foreign files (temp files, operator droppings) are not
                // fragments.
                continue;
            };
            fragment.backing_store = Some(self.root_url.clone());
            fragment.mod_time_ms = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_else(unix_ms);
            fragments.push(fragment);
        }
        fragments.sort_by_key(|f| (f.begin, f.end));
        Ok(fragments)
    }

    fn read(&self, fragment: &Fragment, offset: u64, max_len: usize) -> Result<Bytes, StoreError> {
        if fragment.codec != CompressionCodec::None {
            return Err(StoreError::UnsupportedCodec(fragment.codec));
        }
        if offset < fragment.begin || offset >= fragment.end {
            return Err(StoreError::OffsetOutOfRange {
                offset,
                begin: fragment.begin,
                end: fragment.end,
            });
        }
        let path = self.content_file(fragment);
        let mut file = fs::File::open(&path).map_err(io_err(&path))?;
        file.seek(SeekFrom::Start(offset - fragment.begin))
            .map_err(io_err(&path))?;

        let want = ((fragment.end - offset) as usize).min(max_len);
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..]).map_err(io_err(&path))?;
            if n == 0 {
                return Err(StoreError::Corrupt {
                    path: Some(path),
                    reason: format!("content file shorter than extent, got {filled} of {want}"),
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }

    fn url_for(&self, fragment: &Fragment) -> String {
        format!("{}/{}", self.root_url, fragment.content_path())
    }
}
