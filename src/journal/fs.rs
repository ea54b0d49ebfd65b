use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

/// Filesystem operations the journal needs. `OsFs` backs production, `MemFs` tests.
pub trait JournalFs: Send + Sync + 'static {
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    /// Open for appending, creating the file if needed.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn BufRead + Send>>;
    /// Regular files directly inside `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
    fn exists(&self, path: &Path) -> bool;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

pub type SharedFs = Arc<dyn JournalFs>;

#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl JournalFs for OsFs {
    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
        let file = fs::File::open(path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(entry.path());
            }
        }
        Ok(out)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

type MemFiles = Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>;

/// In-memory filesystem. Directories exist implicitly once created or written into.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    files: MemFiles,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(&self, path: impl Into<PathBuf>, contents: &[u8]) {
        self.files.lock().insert(path.into(), contents.to_vec());
    }

    pub fn read_file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// File names (not full paths) inside `dir`, sorted.
    pub fn file_names(&self, dir: &Path) -> Vec<String> {
        self.files
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }
}

struct MemFile {
    files: MemFiles,
    path: PathBuf,
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl JournalFs for MemFs {
    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        let mut dirs = self.dirs.lock();
        if !dirs.iter().any(|d| d == dir) {
            dirs.push(dir.to_path_buf());
        }
        Ok(())
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.files.lock().entry(path.to_path_buf()).or_default();
        Ok(Box::new(MemFile {
            files: self.files.clone(),
            path: path.to_path_buf(),
        }))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
        match self.files.lock().get(path) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.exists(dir) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", dir.display()),
            ));
        }
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        if self.dirs.lock().iter().any(|d| d == path) {
            return true;
        }
        self.files
            .lock()
            .keys()
            .any(|p| p == path || p.starts_with(path))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match self.files.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_fs_appends_and_lists() {
        let fs = MemFs::new();
        let dir = Path::new("cache");
        fs.create_dir_all(dir).unwrap();
        let path = dir.join("w2_20240101_000000.ndjson");
        {
            let mut file = fs.open_append(&path).unwrap();
            file.write_all(b"one\n").unwrap();
        }
        {
            let mut file = fs.open_append(&path).unwrap();
            file.write_all(b"two\n").unwrap();
        }
        assert_eq!(fs.read_file(&path).unwrap(), b"one\ntwo\n");
        assert_eq!(fs.list(dir).unwrap(), vec![path.clone()]);
        fs.remove(&path).unwrap();
        assert!(fs.list(dir).unwrap().is_empty());
        assert!(fs.list(Path::new("missing")).is_err());
    }
}
