use snafu::ResultExt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use super::{IoSnafu, ReadableStorage, StorageError};

/// Random-access reads over any seekable reader.
///
/// The reader is kept behind a mutex, so concurrent reads through one instance are serialized.
#[derive(Debug)]
pub struct RoIoStorage<Io: Read + Seek + Send> {
    io: Mutex<Io>,
    size: u64,
}

impl<Io: Read + Seek + Send> RoIoStorage<Io> {
    pub fn new(mut io: Io) -> Result<Self, StorageError> {
        let size = io
            .seek(SeekFrom::End(0))
            .context(IoSnafu { operation: "seek" })?;
        io.seek(SeekFrom::Start(0))
            .context(IoSnafu { operation: "seek" })?;
        Ok(Self {
            io: Mutex::new(io),
            size,
        })
    }

    fn check_size(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        match offset.checked_add(buf.len() as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(StorageError::OutOfBounds {}),
        }
    }
}

impl<Io: Read + Seek + Send> ReadableStorage for RoIoStorage<Io> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_size(offset, buf)?;
        // the seek below resets a position left behind by a panicked reader
        let mut io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        io.seek(SeekFrom::Start(offset))
            .context(IoSnafu { operation: "seek" })?;
        io.read_exact(buf).context(IoSnafu { operation: "read" })?;
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}

pub type FileRoStorage = RoIoStorage<File>;

impl FileRoStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let io = File::open(path).context(IoSnafu { operation: "open" })?;
        Self::new(io)
    }
}
