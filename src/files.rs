// src/files.rs - directory-backed file store for macros, printed files and uploads
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};

use krusty_shared::{FileError, FileHandle, FileStore, OpenMode};

enum OpenFile {
    Read { reader: BufReader<File>, consumed: u64, size: u64 },
    Write(File),
}

/// Reads through the next `\n`, `\r` or `\r\n` into `line`, terminator
/// included. Returns the bytes consumed; 0 at end of file.
fn read_terminated(reader: &mut impl BufRead, line: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(consumed);
        }
        if line.last() == Some(&b'\r') {
            // The previous chunk ended on `\r`; swallow a following `\n`.
            let lf = usize::from(available[0] == b'\n');
            reader.consume(lf);
            return Ok(consumed + lf);
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(end) if available[end] == b'\r' => match available.get(end + 1) {
                Some(b'\n') => (end + 2, true),
                Some(_) => (end + 1, true),
                None => (end + 1, false),
            },
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..used]);
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

/// Paths are relative to `root`; anything escaping it is refused.
pub struct DirFileStore {
    root: PathBuf,
    open: HashMap<FileHandle, OpenFile>,
    next_handle: u32,
}

impl DirFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirFileStore { root: root.into(), open: HashMap::new(), next_handle: 0 }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FileError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(FileError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl FileStore for DirFileStore {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FileError> {
        let full = self.resolve(path)?;
        let file = match mode {
            OpenMode::Read => {
                let file = File::open(&full).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => FileError::NotFound(path.to_string()),
                    _ => FileError::Io(e),
                })?;
                let size = file.metadata()?.len();
                OpenFile::Read { reader: BufReader::new(file), consumed: 0, size }
            }
            OpenMode::Write => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                OpenFile::Write(File::create(&full)?)
            }
        };
        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = FileHandle(self.next_handle);
        self.open.insert(handle, file);
        tracing::debug!(%path, ?mode, ?handle, "file opened");
        Ok(handle)
    }

    fn read_line(&mut self, handle: FileHandle) -> Result<Option<Vec<u8>>, FileError> {
        let Some(OpenFile::Read { reader, consumed, .. }) = self.open.get_mut(&handle) else {
            return Err(if self.open.contains_key(&handle) {
                FileError::WrongMode(handle, OpenMode::Read)
            } else {
                FileError::BadHandle(handle)
            });
        };
        let mut line = Vec::new();
        let n = read_terminated(reader, &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        *consumed += n as u64;
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    fn write(&mut self, handle: FileHandle, bytes: &[u8]) -> Result<(), FileError> {
        match self.open.get_mut(&handle) {
            Some(OpenFile::Write(file)) => Ok(file.write_all(bytes)?),
            Some(OpenFile::Read { .. }) => Err(FileError::WrongMode(handle, OpenMode::Write)),
            None => Err(FileError::BadHandle(handle)),
        }
    }

    fn fraction_read(&self, handle: FileHandle) -> f64 {
        match self.open.get(&handle) {
            Some(OpenFile::Read { consumed, size, .. }) if *size > 0 => *consumed as f64 / *size as f64,
            _ => 0.0,
        }
    }

    fn close(&mut self, handle: FileHandle) {
        if let Some(OpenFile::Write(mut file)) = self.open.remove(&handle) {
            if let Err(e) = file.flush() {
                tracing::warn!(?handle, error = %e, "flush on close failed");
            }
        }
    }

    fn delete(&mut self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => fs::remove_file(full).is_ok(),
            Err(_) => false,
        }
    }
}
