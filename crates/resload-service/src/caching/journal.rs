//! A size-bounded blob store that keeps its LRU order in an append-only journal.
//!
//! The store directory contains one file per entry, named by the entry, plus a `journal` file.
//! The journal starts with a short header followed by one record per line:
//!
//! - `DIRTY <name>`: an entry is being written. Must be followed by `CLEAN` or `REMOVE` for the
//!   same name, otherwise the blob is incomplete and discarded on the next open.
//! - `CLEAN <name> <size>`: an entry was published with `size` bytes.
//! - `REMOVE <name>`: an entry was removed or its write was aborted.
//! - `READ <name>`: an entry was accessed, which moves it to the recent end of the LRU order.
//!
//! Whenever the number of redundant records grows past a threshold, the journal is compacted
//! into one `CLEAN` record per live entry.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::utils::defer::defer;

const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
const TMP_DIR: &str = "tmp";

const MAGIC: &str = "resload.journal";
const VERSION: &str = "1";
const VALUE_COUNT: &str = "1";

const COMPACT_THRESHOLD: usize = 2000;
const MAX_NAME_LEN: usize = 120;

/// An error in the disk cache or its journal store.
#[derive(Debug, Error)]
pub enum DiskCacheError {
    #[error("disk cache I/O failed")]
    Io(#[from] io::Error),
    #[error("corrupt journal: {0}")]
    Corrupt(String),
    #[error("invalid entry name {0:?}")]
    InvalidName(String),
    #[error("journal store is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Dirty,
    Clean,
    Remove,
    Read,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Dirty => "DIRTY",
            Op::Clean => "CLEAN",
            Op::Remove => "REMOVE",
            Op::Read => "READ",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    seq: u64,
}

/// A blob being written. Publish it with [`JournalStore::commit`], or discard it with
/// [`JournalStore::abort`].
#[derive(Debug)]
pub struct Editor {
    name: String,
    file: NamedTempFile,
}

impl Editor {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Write for Editor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A readable view of a published blob.
///
/// The underlying file stays readable even if the entry is evicted afterwards.
#[derive(Debug)]
pub struct Snapshot {
    file: File,
    len: u64,
}

impl Snapshot {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for Snapshot {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// See the [module level documentation](self).
///
/// All mutating operations take `&mut self`, callers that share a store serialize access
/// through a lock.
#[derive(Debug)]
pub struct JournalStore {
    directory: PathBuf,
    max_size: u64,
    size: u64,
    entries: HashMap<String, Entry>,
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    redundant_records: usize,
    journal: Option<BufWriter<File>>,
}

impl JournalStore {
    /// Opens the store in `directory`, creating it if necessary.
    ///
    /// Incomplete writes and files unknown to the journal are deleted. A corrupt journal wipes
    /// the whole directory and starts over with an empty store.
    pub fn open(directory: &Path, max_size: u64) -> Result<Self, DiskCacheError> {
        fs::create_dir_all(directory)?;

        let journal_path = directory.join(JOURNAL_FILE);
        let backup_path = directory.join(JOURNAL_FILE_BACKUP);
        if backup_path.exists() {
            if journal_path.exists() {
                fs::remove_file(&backup_path)?;
            } else {
                fs::rename(&backup_path, &journal_path)?;
            }
        }

        let mut store = Self {
            directory: directory.to_owned(),
            max_size,
            size: 0,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_seq: 0,
            redundant_records: 0,
            journal: None,
        };

        if journal_path.exists() {
            match store.replay(&journal_path) {
                Ok(()) => {}
                Err(DiskCacheError::Corrupt(reason)) => {
                    tracing::warn!(
                        directory = %directory.display(),
                        %reason,
                        "disk cache journal is corrupt, removing"
                    );
                    store.reset_directory()?;
                }
                Err(e) => return Err(e),
            }
        }

        store.remove_unknown_files()?;
        store.rebuild_journal()?;
        store.trim_to_size()?;

        tracing::debug!(
            directory = %directory.display(),
            entries = store.entries.len(),
            size = store.size,
            "opened journal store"
        );
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The summed size of all published blobs.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.journal.is_none()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns a snapshot of the entry `name` and marks it as most recently used.
    pub fn get(&mut self, name: &str) -> Result<Option<Snapshot>, DiskCacheError> {
        self.check_open()?;
        validate_name(name)?;

        let Some(entry) = self.entries.get(name).copied() else {
            return Ok(None);
        };
        let file = match File::open(self.blob_path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(name, "blob vanished from disk cache");
                self.remove(name)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.touch(name);
        self.append(Op::Read, name, None)?;
        self.redundant_records += 1;
        self.compact_if_needed()?;

        Ok(Some(Snapshot {
            file,
            len: entry.size,
        }))
    }

    /// Starts writing the entry `name`.
    pub fn edit(&mut self, name: &str) -> Result<Editor, DiskCacheError> {
        self.check_open()?;
        validate_name(name)?;

        let tmp_dir = self.directory.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        let file = tempfile::Builder::new()
            .prefix(name)
            .tempfile_in(&tmp_dir)?;

        // flushed right away so a crash mid-write leaves a trace of the incomplete entry
        self.append(Op::Dirty, name, None)?;
        self.flush()?;

        Ok(Editor {
            name: name.to_owned(),
            file,
        })
    }

    /// Publishes the blob written through `editor`, returning its size.
    ///
    /// Publishing may evict least recently used entries until the store fits its maximum size.
    pub fn commit(&mut self, editor: Editor) -> Result<u64, DiskCacheError> {
        self.check_open()?;
        let Editor { name, mut file } = editor;

        file.flush()?;
        let size = file.as_file().metadata()?.len();
        if let Err(e) = file.persist(self.blob_path(&name)) {
            self.append(Op::Remove, &name, None)?;
            self.redundant_records += 1;
            return Err(e.error.into());
        }

        if let Some(previous) = self.entries.get(&name) {
            self.size -= previous.size;
            self.redundant_records += 1;
        }
        self.entries.insert(name.clone(), Entry { size, seq: 0 });
        self.touch(&name);
        self.size += size;
        self.append(Op::Clean, &name, Some(size))?;
        // the DIRTY record is now redundant
        self.redundant_records += 1;

        self.trim_to_size()?;
        self.compact_if_needed()?;
        Ok(size)
    }

    /// Discards the blob written through `editor`, keeping any previously published version.
    pub fn abort(&mut self, editor: Editor) -> Result<(), DiskCacheError> {
        self.check_open()?;
        let Editor { name, file } = editor;
        drop(file);

        match self.entries.get(&name).copied() {
            Some(entry) => self.append(Op::Clean, &name, Some(entry.size))?,
            None => self.append(Op::Remove, &name, None)?,
        }
        self.redundant_records += 2;
        self.compact_if_needed()
    }

    /// Removes the entry `name`, returning whether it existed.
    pub fn remove(&mut self, name: &str) -> Result<bool, DiskCacheError> {
        self.check_open()?;
        validate_name(name)?;

        let Some(entry) = self.entries.remove(name) else {
            return Ok(false);
        };
        self.lru.remove(&entry.seq);
        self.size -= entry.size;
        match fs::remove_file(self.blob_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.append(Op::Remove, name, None)?;
        self.redundant_records += 2;
        self.compact_if_needed()?;
        Ok(true)
    }

    /// Writes buffered journal records to disk.
    pub fn flush(&mut self) -> Result<(), DiskCacheError> {
        let journal = self.journal.as_mut().ok_or(DiskCacheError::Closed)?;
        journal.flush()?;
        Ok(())
    }

    /// Flushes and releases the journal. Closing a closed store does nothing.
    pub fn close(&mut self) -> Result<(), DiskCacheError> {
        if let Some(mut journal) = self.journal.take() {
            journal.flush()?;
        }
        Ok(())
    }

    /// Closes the store and removes its directory with everything in it.
    pub fn delete(mut self) -> Result<(), DiskCacheError> {
        self.close()?;
        remove_dir_all_if_exists(&self.directory)?;
        Ok(())
    }

    fn check_open(&self) -> Result<(), DiskCacheError> {
        match self.journal {
            Some(_) => Ok(()),
            None => Err(DiskCacheError::Closed),
        }
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn touch(&mut self, name: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(name) {
            self.lru.remove(&entry.seq);
            entry.seq = seq;
            self.lru.insert(seq, name.to_owned());
        }
    }

    fn append(&mut self, op: Op, name: &str, size: Option<u64>) -> Result<(), DiskCacheError> {
        let journal = self.journal.as_mut().ok_or(DiskCacheError::Closed)?;
        match size {
            Some(size) => writeln!(journal, "{} {name} {size}", op.as_str())?,
            None => writeln!(journal, "{} {name}", op.as_str())?,
        }
        Ok(())
    }

    fn trim_to_size(&mut self) -> Result<(), DiskCacheError> {
        while self.size > self.max_size {
            let Some(name) = self.lru.values().next().cloned() else {
                break;
            };
            tracing::trace!(%name, "evicting from disk cache");
            self.remove(&name)?;
            metric!(counter("caches.disk.evicted") += 1);
        }
        Ok(())
    }

    fn compact_if_needed(&mut self) -> Result<(), DiskCacheError> {
        if self.redundant_records >= COMPACT_THRESHOLD
            && self.redundant_records >= self.entries.len()
        {
            self.rebuild_journal()?;
        }
        Ok(())
    }

    /// Reconstructs entries and LRU order from the journal at `path`.
    fn replay(&mut self, path: &Path) -> Result<(), DiskCacheError> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        for expected in [MAGIC, VERSION, VALUE_COUNT, ""] {
            let line = lines.next().transpose()?.unwrap_or_default();
            if line != expected {
                return Err(DiskCacheError::Corrupt(format!(
                    "unexpected header line {line:?}"
                )));
            }
        }

        let mut dirty = Vec::new();
        let mut records = 0usize;
        for line in lines {
            let line = line?;
            records += 1;
            let mut parts = line.split(' ');
            let op = parts.next().unwrap_or_default();
            let name = parts
                .next()
                .filter(|name| validate_name(name).is_ok())
                .ok_or_else(|| DiskCacheError::Corrupt(format!("bad record {line:?}")))?;

            match (op, parts.next(), parts.next()) {
                ("CLEAN", Some(size), None) => {
                    let size = size
                        .parse()
                        .map_err(|_| DiskCacheError::Corrupt(format!("bad size in {line:?}")))?;
                    let entry = Entry { size, seq: 0 };
                    if let Some(previous) = self.entries.insert(name.to_owned(), entry) {
                        self.lru.remove(&previous.seq);
                        self.size -= previous.size;
                    }
                    self.size += size;
                    self.touch(name);
                    dirty.retain(|d: &String| d != name);
                }
                ("DIRTY", None, None) => dirty.push(name.to_owned()),
                ("REMOVE", None, None) => {
                    if let Some(entry) = self.entries.remove(name) {
                        self.lru.remove(&entry.seq);
                        self.size -= entry.size;
                    }
                    dirty.retain(|d| d != name);
                }
                ("READ", None, None) => self.touch(name),
                _ => {
                    return Err(DiskCacheError::Corrupt(format!("bad record {line:?}")));
                }
            }
        }

        // blobs of incomplete writes are deleted by `remove_unknown_files`
        for name in dirty {
            if let Some(entry) = self.entries.remove(&name) {
                self.lru.remove(&entry.seq);
                self.size -= entry.size;
            }
        }

        // published blobs that went missing
        let missing: Vec<_> = self
            .entries
            .keys()
            .filter(|name| !self.blob_path(name).is_file())
            .cloned()
            .collect();
        for name in missing {
            if let Some(entry) = self.entries.remove(&name) {
                self.lru.remove(&entry.seq);
                self.size -= entry.size;
            }
        }

        self.redundant_records = records.saturating_sub(self.entries.len());
        Ok(())
    }

    /// Deletes every file in the store directory that is not a live blob or a journal file.
    fn remove_unknown_files(&self) -> io::Result<()> {
        remove_dir_all_if_exists(&self.directory.join(TMP_DIR))?;

        for dir_entry in fs::read_dir(&self.directory)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name == JOURNAL_FILE || self.entries.contains_key(file_name) {
                continue;
            }
            let path = dir_entry.path();
            tracing::trace!(path = %path.display(), "removing unknown file from disk cache");
            if dir_entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn reset_directory(&mut self) -> io::Result<()> {
        self.entries.clear();
        self.lru.clear();
        self.size = 0;
        remove_dir_all_if_exists(&self.directory)?;
        fs::create_dir_all(&self.directory)
    }

    /// Replaces the journal with one `CLEAN` record per live entry, in LRU order.
    fn rebuild_journal(&mut self) -> Result<(), DiskCacheError> {
        if let Some(mut journal) = self.journal.take() {
            journal.flush()?;
        }

        let journal_path = self.directory.join(JOURNAL_FILE);
        let tmp_path = self.directory.join(JOURNAL_FILE_TMP);
        let backup_path = self.directory.join(JOURNAL_FILE_BACKUP);

        let cleanup = defer(|| {
            let _ = fs::remove_file(&tmp_path);
        });
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writeln!(writer, "{MAGIC}\n{VERSION}\n{VALUE_COUNT}\n")?;
            for name in self.lru.values() {
                let size = self.entries.get(name).map_or(0, |entry| entry.size);
                writeln!(writer, "{} {name} {size}", Op::Clean.as_str())?;
            }
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        if journal_path.exists() {
            fs::rename(&journal_path, &backup_path)?;
        }
        fs::rename(&tmp_path, &journal_path)?;
        cleanup.dismiss();
        let _ = fs::remove_file(&backup_path);

        let file = OpenOptions::new().append(true).open(&journal_path)?;
        self.journal = Some(BufWriter::new(file));
        self.redundant_records = 0;
        Ok(())
    }
}

impl Drop for JournalStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = &e as &dyn std::error::Error, "failed to close journal store");
        }
    }
}

fn validate_name(name: &str) -> Result<(), DiskCacheError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        && !matches!(name, JOURNAL_FILE | TMP_DIR);
    if valid {
        Ok(())
    } else {
        Err(DiskCacheError::InvalidName(name.to_owned()))
    }
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
