// In-memory file store keyed by path.

use std::collections::HashMap;

use krusty_shared::{FileError, FileHandle, FileStore, OpenMode};

#[derive(Debug)]
struct OpenFile {
    path: String,
    mode: OpenMode,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: HashMap<String, Vec<u8>>,
    open: HashMap<FileHandle, OpenFile>,
    next_handle: u32,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, contents: &str) {
        self.files.insert(path.to_string(), contents.as_bytes().to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.files.get(path).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn entry(&mut self, handle: FileHandle, mode: OpenMode) -> Result<&mut OpenFile, FileError> {
        let file = self.open.get_mut(&handle).ok_or(FileError::BadHandle(handle))?;
        if file.mode != mode {
            return Err(FileError::WrongMode(handle, mode));
        }
        Ok(file)
    }
}

impl FileStore for MemoryFiles {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FileError> {
        match mode {
            OpenMode::Read if !self.files.contains_key(path) => return Err(FileError::NotFound(path.to_string())),
            OpenMode::Read => {}
            OpenMode::Write => {
                self.files.insert(path.to_string(), Vec::new());
            }
        }
        self.next_handle += 1;
        let handle = FileHandle(self.next_handle);
        self.open.insert(handle, OpenFile { path: path.to_string(), mode, cursor: 0 });
        Ok(handle)
    }

    fn read_line(&mut self, handle: FileHandle) -> Result<Option<Vec<u8>>, FileError> {
        let file = self.entry(handle, OpenMode::Read)?;
        let path = file.path.clone();
        let cursor = file.cursor;
        let data = self.files.get(&path).ok_or(FileError::NotFound(path))?;
        if cursor >= data.len() {
            return Ok(None);
        }
        let rest = &data[cursor..];
        // `\n`, `\r` and `\r\n` all end a line.
        let (line, consumed) = match rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(end) if rest[end] == b'\r' && rest.get(end + 1) == Some(&b'\n') => (&rest[..end], end + 2),
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        let line = line.to_vec();
        if let Some(file) = self.open.get_mut(&handle) {
            file.cursor += consumed;
        }
        Ok(Some(line))
    }

    fn write(&mut self, handle: FileHandle, bytes: &[u8]) -> Result<(), FileError> {
        let path = self.entry(handle, OpenMode::Write)?.path.clone();
        self.files.entry(path).or_default().extend_from_slice(bytes);
        Ok(())
    }

    fn fraction_read(&self, handle: FileHandle) -> f64 {
        let Some(file) = self.open.get(&handle) else {
            return 0.0;
        };
        match self.files.get(&file.path) {
            Some(data) if !data.is_empty() => file.cursor as f64 / data.len() as f64,
            _ => 0.0,
        }
    }

    fn close(&mut self, handle: FileHandle) {
        self.open.remove(&handle);
    }

    fn delete(&mut self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_lines_then_eof() {
        let mut files = MemoryFiles::new();
        files.insert("gcodes/a.g", "G28\r\nG1 X1\rM400");
        let h = files.open("gcodes/a.g", OpenMode::Read).unwrap();
        assert_eq!(files.read_line(h).unwrap().as_deref(), Some(&b"G28"[..]));
        assert_eq!(files.read_line(h).unwrap().as_deref(), Some(&b"G1 X1"[..]));
        assert!(files.fraction_read(h) < 1.0);
        assert_eq!(files.read_line(h).unwrap().as_deref(), Some(&b"M400"[..]));
        assert_eq!(files.read_line(h).unwrap(), None);
        assert_eq!(files.fraction_read(h), 1.0);
    }

    #[test]
    fn write_truncates_and_appends() {
        let mut files = MemoryFiles::new();
        files.insert("gcodes/b.g", "old");
        let h = files.open("gcodes/b.g", OpenMode::Write).unwrap();
        files.write(h, b"G1 X1\n").unwrap();
        assert!(matches!(files.read_line(h), Err(FileError::WrongMode(_, OpenMode::Read))));
        files.close(h);
        assert_eq!(files.contents("gcodes/b.g").as_deref(), Some("G1 X1\n"));
        assert!(matches!(files.write(h, b"x"), Err(FileError::BadHandle(_))));
    }

    #[test]
    fn missing_file_is_not_found() {
        let mut files = MemoryFiles::new();
        assert!(matches!(files.open("sys/none.g", OpenMode::Read), Err(FileError::NotFound(_))));
        assert!(!files.delete("sys/none.g"));
    }
}
