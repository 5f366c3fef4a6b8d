//! Storage backends
//!
//! A [`Storage`] is a flat directory of named files with positioned reads and
//! append-only writes. Two implementations ship with the crate:
//!
//! - [`FsStorage`] - a directory on the local filesystem
//! - [`MemoryStorage`] - files held in process memory
//!
//! Block caching needs a last-modified stamp per file to derive cache names.
//! Backends advertise it through [`Storage::supports_file_modified`].

use crate::error::{BlockCacheError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// What a file is being opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoContext {
    #[default]
    Default,
    /// Read once, front to back
    ReadOnce,
    /// Writing a freshly flushed file
    Flush,
    /// Background merge of existing files
    Merge,
}

/// Readable view of one file
pub trait StorageInput: Send {
    fn name(&self) -> &str;

    fn length(&self) -> u64;

    /// Current logical read position
    fn file_pointer(&self) -> u64;

    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Fill `buf` completely from the current position, advancing it
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Independent view of the same file with its own position
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;
}

/// Writable, append-only view of one file
pub trait StorageOutput: Send {
    fn name(&self) -> &str;

    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Number of bytes written so far
    fn file_pointer(&self) -> u64;

    fn flush(&mut self) -> Result<()>;

    /// Flush and finish the file; later writes fail
    fn close(&mut self) -> Result<()>;
}

/// Held lock on a named resource; released on drop
pub trait StorageLock: Send {
    fn name(&self) -> &str;

    fn release(self: Box<Self>) -> Result<()>;
}

/// Flat directory of files
pub trait Storage: Send + Sync {
    fn open_input(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageInput>>;

    /// Create (or truncate) `name`
    fn create_output(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageOutput>>;

    fn list_all(&self) -> Result<Vec<String>>;

    fn delete_file(&self, name: &str) -> Result<()>;

    fn file_exists(&self, name: &str) -> Result<bool>;

    fn file_length(&self, name: &str) -> Result<u64>;

    /// Last-modified stamp of `name`; changes whenever the file is replaced
    fn file_modified(&self, name: &str) -> Result<u64> {
        Err(BlockCacheError::Unsupported(format!(
            "file_modified({}) on a backend without modification times",
            name
        )))
    }

    fn supports_file_modified(&self) -> bool {
        false
    }

    /// Make `names` durable
    fn sync(&self, names: &[String]) -> Result<()>;

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        Err(BlockCacheError::Unsupported(format!("locking {}", name)))
    }

    fn close(&self) -> Result<()>;
}

fn not_found(name: &str, err: std::io::Error) -> BlockCacheError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BlockCacheError::FileNotFound(name.to_string())
    } else {
        BlockCacheError::Io(err)
    }
}

fn check_read(name: &str, position: u64, wanted: usize, length: u64) -> Result<()> {
    let past_end = position
        .checked_add(wanted as u64)
        .map_or(true, |end| end > length);
    if past_end {
        return Err(BlockCacheError::ReadPastEof {
            name: name.to_string(),
            position,
            length,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Directory on the local filesystem
#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
    closed: AtomicBool,
}

impl FsStorage {
    /// Open `root`, creating it if needed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(FsStorage {
            root: root.as_ref().to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlockCacheError::Closed(self.root.display().to_string()));
        }
        Ok(())
    }
}

impl Storage for FsStorage {
    fn open_input(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageInput>> {
        self.ensure_open()?;
        Ok(Box::new(FsInput::open(name, self.path(name))?))
    }

    fn create_output(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageOutput>> {
        self.ensure_open()?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(name))?;
        Ok(Box::new(FsOutput {
            name: name.to_string(),
            writer: Some(BufWriter::new(file)),
            written: 0,
        }))
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        std::fs::remove_file(self.path(name)).map_err(|e| not_found(name, e))
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).is_file())
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        let meta = std::fs::metadata(self.path(name)).map_err(|e| not_found(name, e))?;
        Ok(meta.len())
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        let meta = std::fs::metadata(self.path(name)).map_err(|e| not_found(name, e))?;
        let modified = meta.modified()?;
        let since_epoch = modified
            .duration_since(UNIX_EPOCH)
            .map_err(|e| BlockCacheError::Io(std::io::Error::other(e)))?;
        Ok(since_epoch.as_nanos() as u64)
    }

    fn supports_file_modified(&self) -> bool {
        true
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            File::open(self.path(name))
                .map_err(|e| not_found(name, e))?
                .sync_all()?;
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.ensure_open()?;
        let path = self.path(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Box::new(FsLock {
                name: name.to_string(),
                path,
                held: true,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BlockCacheError::LockHeld(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct FsInput {
    name: String,
    path: PathBuf,
    file: File,
    length: u64,
    pos: u64,
}

impl FsInput {
    fn open(name: &str, path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(|e| not_found(name, e))?;
        let length = file.metadata()?.len();
        Ok(FsInput {
            name: name.to_string(),
            path,
            file,
            length,
            pos: 0,
        })
    }
}

impl StorageInput for FsInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        check_read(&self.name, self.pos, buf.len(), self.length)?;
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        let mut clone = FsInput::open(&self.name, self.path.clone())?;
        clone.pos = self.pos;
        Ok(Box::new(clone))
    }
}

struct FsOutput {
    name: String,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FsOutput {
    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        let name = &self.name;
        self.writer
            .as_mut()
            .ok_or_else(|| BlockCacheError::Closed(name.clone()))
    }
}

impl StorageOutput for FsOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer()?.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.written
    }

    fn flush(&mut self) -> Result<()> {
        self.writer()?.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

struct FsLock {
    name: String,
    path: PathBuf,
    held: bool,
}

impl StorageLock for FsLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(mut self: Box<Self>) -> Result<()> {
        self.held = false;
        std::fs::remove_file(&self.path).map_err(|e| not_found(&self.name, e))
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Arc<Vec<u8>>,
    modified: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: RwLock<HashMap<String, MemoryFile>>,
    locks: Mutex<HashSet<String>>,
    /// Bumped on every publish so each version of a file gets a new stamp
    clock: AtomicU64,
    /// Successful `read_bytes` calls across all inputs
    reads: AtomicU64,
    closed: AtomicBool,
}

impl MemoryState {
    fn publish(&self, name: &str, data: Vec<u8>) {
        let modified = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
        self.files.write().insert(
            name.to_string(),
            MemoryFile {
                data: Arc::new(data),
                modified,
            },
        );
    }

    fn get(&self, name: &str) -> Result<MemoryFile> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BlockCacheError::FileNotFound(name.to_string()))
    }
}

/// Files held in memory.
///
/// Writes become visible on `flush` or `close`. Each publish gets a new,
/// strictly increasing modification stamp.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<MemoryState>,
    track_modified: bool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            state: Arc::new(MemoryState::default()),
            track_modified: true,
        }
    }

    /// Backend that reports no modification times
    pub fn without_timestamps() -> Self {
        MemoryStorage {
            state: Arc::new(MemoryState::default()),
            track_modified: false,
        }
    }

    /// Write a whole file in one step
    pub fn put_file(&self, name: &str, data: &[u8]) {
        self.state.publish(name, data.to_vec());
    }

    /// Number of `read_bytes` calls served by this backend
    pub fn backend_reads(&self) -> u64 {
        self.state.reads.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(BlockCacheError::Closed("memory storage".to_string()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageInput>> {
        self.ensure_open()?;
        let file = self.state.get(name)?;
        Ok(Box::new(MemoryInput {
            name: name.to_string(),
            data: file.data,
            pos: 0,
            state: Arc::clone(&self.state),
        }))
    }

    fn create_output(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageOutput>> {
        self.ensure_open()?;
        self.state.publish(name, Vec::new());
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            dirty: false,
            closed: false,
            state: Arc::clone(&self.state),
        }))
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names: Vec<String> = self.state.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state
            .files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BlockCacheError::FileNotFound(name.to_string()))
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.files.read().contains_key(name))
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(self.state.get(name)?.data.len() as u64)
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        if !self.track_modified {
            return Err(BlockCacheError::Unsupported(format!(
                "file_modified({}) on a memory storage without timestamps",
                name
            )));
        }
        Ok(self.state.get(name)?.modified)
    }

    fn supports_file_modified(&self) -> bool {
        self.track_modified
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.state.get(name)?;
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.ensure_open()?;
        if !self.state.locks.lock().insert(name.to_string()) {
            return Err(BlockCacheError::LockHeld(name.to_string()));
        }
        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            held: true,
        }))
    }

    fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryInput {
    name: String,
    data: Arc<Vec<u8>>,
    pos: u64,
    state: Arc<MemoryState>,
}

impl StorageInput for MemoryInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        check_read(&self.name, self.pos, buf.len(), self.length())?;
        let start = self.pos as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        self.pos += buf.len() as u64;
        self.state.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MemoryInput {
            name: self.name.clone(),
            data: Arc::clone(&self.data),
            pos: self.pos,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    dirty: bool,
    closed: bool,
    state: Arc<MemoryState>,
}

impl StorageOutput for MemoryOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(BlockCacheError::Closed(self.name.clone()));
        }
        self.buffer.extend_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.state.publish(&self.name, self.buffer.clone());
            self.dirty = false;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.flush()?;
            self.closed = true;
        }
        Ok(())
    }
}

struct MemoryLock {
    name: String,
    state: Arc<MemoryState>,
    held: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(mut self: Box<Self>) -> Result<()> {
        self.held = false;
        self.state.locks.lock().remove(&self.name);
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.held {
            self.state.locks.lock().remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(storage: &dyn Storage, name: &str, data: &[u8]) {
        let mut out = storage.create_output(name, IoContext::Default).unwrap();
        out.write_bytes(data).unwrap();
        out.close().unwrap();
    }

    fn exercise_backend(storage: &dyn Storage) {
        write_file(storage, "a.bin", b"hello world");
        assert!(storage.file_exists("a.bin").unwrap());
        assert_eq!(storage.file_length("a.bin").unwrap(), 11);
        assert_eq!(storage.list_all().unwrap(), vec!["a.bin".to_string()]);

        let mut input = storage.open_input("a.bin", IoContext::Default).unwrap();
        input.seek(6).unwrap();
        let mut buf = [0u8; 5];
        input.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(input.file_pointer(), 11);

        let mut clone = input.clone_input().unwrap();
        clone.seek(0).unwrap();
        clone.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(input.file_pointer(), 11);

        let err = input.read_bytes(&mut buf).unwrap_err();
        assert!(matches!(err, BlockCacheError::ReadPastEof { .. }));

        storage.sync(&["a.bin".to_string()]).unwrap();
        storage.delete_file("a.bin").unwrap();
        assert!(!storage.file_exists("a.bin").unwrap());
        assert!(storage.delete_file("a.bin").unwrap_err().is_not_found());
        assert!(storage
            .open_input("a.bin", IoContext::Default)
            .err()
            .unwrap()
            .is_not_found());
    }

    #[test]
    fn test_fs_storage() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        exercise_backend(&storage);
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        exercise_backend(&storage);
    }

    #[test]
    fn test_far_seek_reads_past_eof() {
        let dir = TempDir::new().unwrap();
        let fs = FsStorage::open(dir.path()).unwrap();
        let mem = MemoryStorage::new();

        for storage in [&fs as &dyn Storage, &mem as &dyn Storage] {
            write_file(storage, "a", b"abc");
            let mut input = storage.open_input("a", IoContext::Default).unwrap();
            input.seek(u64::MAX).unwrap();
            let mut buf = [0u8; 1];
            assert!(matches!(
                input.read_bytes(&mut buf),
                Err(BlockCacheError::ReadPastEof { .. })
            ));
        }
    }

    #[test]
    fn test_memory_modified_changes_on_rewrite() {
        let storage = MemoryStorage::new();
        storage.put_file("a", b"one");
        let first = storage.file_modified("a").unwrap();
        storage.put_file("a", b"two");
        assert!(storage.file_modified("a").unwrap() > first);
    }

    #[test]
    fn test_memory_without_timestamps() {
        let storage = MemoryStorage::without_timestamps();
        storage.put_file("a", b"one");
        assert!(!storage.supports_file_modified());
        assert!(matches!(
            storage.file_modified("a"),
            Err(BlockCacheError::Unsupported(_))
        ));
    }

    #[test]
    fn test_fs_modified_available() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        write_file(&storage, "a", b"x");
        assert!(storage.supports_file_modified());
        assert!(storage.file_modified("a").unwrap() > 0);
        assert!(storage.file_modified("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_locks_are_exclusive() {
        let dir = TempDir::new().unwrap();
        let fs = FsStorage::open(dir.path()).unwrap();
        let mem = MemoryStorage::new();

        for storage in [&fs as &dyn Storage, &mem as &dyn Storage] {
            let lock = storage.obtain_lock("write.lock").unwrap();
            assert!(matches!(
                storage.obtain_lock("write.lock"),
                Err(BlockCacheError::LockHeld(_))
            ));
            lock.release().unwrap();
            let again = storage.obtain_lock("write.lock").unwrap();
            drop(again);
            storage.obtain_lock("write.lock").unwrap();
        }
    }

    #[test]
    fn test_closed_storage_rejects_io() {
        let storage = MemoryStorage::new();
        storage.close().unwrap();
        assert!(matches!(
            storage.create_output("a", IoContext::Default),
            Err(BlockCacheError::Closed(_))
        ));
    }
}
