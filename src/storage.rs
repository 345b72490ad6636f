//! # Summary
//!
//! This module abstracts over stable storage. To recover from a crash, both
//! the transport and the consensus engine require that some state persist
//! between failures.
//!
//! Two primitives, both backed by `bincode` on the filesystem: [`Storage`]
//! rewrites a whole value atomically (temporary file, fsync, rename) and
//! [`Log`] appends structurally-typed records behind a magic/version header.
//! A write that cannot be made durable halts the node: every acknowledged
//! protocol transition must be on disk before the acknowledgment exists, so
//! there is no correct way to continue past a storage fault.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Identifies the record format; bump when a record layout changes.
const LOG_MAGIC: [u8; 4] = *b"acd1";

/// Whole-value persistent storage, replaced atomically on every save.
pub struct Storage<S> {
    path: PathBuf,
    tmp: PathBuf,
    _marker: PhantomData<S>,
}

impl<S> Storage<S> {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Storage {
            path,
            tmp: PathBuf::from(tmp),
            _marker: PhantomData,
        }
    }
}

impl<S: serde::de::DeserializeOwned> Storage<S> {
    /// Attempts to load the value from disk, returning None if nothing has
    /// been written yet. A leftover temporary file from a crash mid-save is
    /// ignored; the previous value is still intact at the real path.
    pub fn load(&self) -> Option<S> {
        let bytes = fs::read(&self.path).ok()?;
        bincode::deserialize(&bytes).ok()
    }
}

impl<S: serde::Serialize> Storage<S> {
    /// Replaces the stored value. The new bytes are synced before the swap,
    /// so a crash at any point leaves either the old or the new value.
    pub fn save(&mut self, state: &S) {
        let bytes =
            bincode::serialize(state).expect("[STORAGE ERROR]: failed to serialize state");
        let mut file =
            fs::File::create(&self.tmp).expect("[STORAGE ERROR]: could not create temp file");
        file.write_all(&bytes)
            .expect("[STORAGE ERROR]: failed to write state");
        file.sync_all()
            .expect("[STORAGE ERROR]: failed to sync state");
        fs::rename(&self.tmp, &self.path).expect("[STORAGE ERROR]: failed to swap state file");
    }
}

/// Append-only record log.
pub struct Log<R> {
    file: fs::File,
    _marker: PhantomData<R>,
}

impl<R> Log<R> {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .expect("[STORAGE ERROR]: could not open log");
        let len = file
            .metadata()
            .expect("[STORAGE ERROR]: could not stat log")
            .len();
        if len == 0 {
            file.write_all(&LOG_MAGIC)
                .expect("[STORAGE ERROR]: failed to write log header");
            file.sync_all()
                .expect("[STORAGE ERROR]: failed to sync log header");
        }
        Log {
            file,
            _marker: PhantomData,
        }
    }
}

impl<R: serde::de::DeserializeOwned> Log<R> {
    /// Replays every complete record in append order. A torn tail left by a
    /// crash mid-append is trimmed off, leaving the log in its pre-append
    /// state.
    pub fn replay(&mut self) -> Vec<R> {
        self.file
            .seek(SeekFrom::Start(0))
            .expect("[STORAGE ERROR]: failed to rewind log");
        let mut magic = [0u8; 4];
        self.file
            .read_exact(&mut magic)
            .expect("[STORAGE ERROR]: failed to read log header");
        if magic != LOG_MAGIC {
            panic!("[STORAGE ERROR]: log header mismatch: {:?}", magic);
        }
        let mut records = Vec::new();
        let mut good = LOG_MAGIC.len() as u64;
        loop {
            match bincode::deserialize_from(&mut self.file) {
                Ok(record) => {
                    records.push(record);
                    good = self
                        .file
                        .stream_position()
                        .expect("[STORAGE ERROR]: failed to read log position");
                }
                Err(_) => break,
            }
        }
        let len = self
            .file
            .metadata()
            .expect("[STORAGE ERROR]: could not stat log")
            .len();
        if len > good {
            warn!("discarding {} bytes of torn log tail", len - good);
            self.file
                .set_len(good)
                .expect("[STORAGE ERROR]: failed to trim torn log");
        }
        self.file
            .seek(SeekFrom::End(0))
            .expect("[STORAGE ERROR]: failed to seek log end");
        records
    }
}

impl<R: serde::Serialize> Log<R> {
    /// Appends one record and syncs it before returning; once this returns,
    /// the record survives a crash.
    pub fn append(&mut self, record: &R) {
        bincode::serialize_into(&mut self.file, record)
            .expect("[STORAGE ERROR]: failed to append record");
        self.file
            .sync_data()
            .expect("[STORAGE ERROR]: failed to sync log");
    }
}
