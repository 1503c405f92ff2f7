//! Firmware image sources.
//!
//! The transfer reads the image one chunk at a time at device-chosen
//! offsets, so sources expose random access instead of a stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Image too large: {size} bytes exceeds the 32-bit offset space")]
    TooLarge { size: u64 },
    #[error("Read at offset {offset} is past the end of a {size}-byte image")]
    OutOfRange { offset: u32, size: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Random-access firmware image.
pub trait ChunkSource: Send {
    /// Image size in bytes.
    fn size(&self) -> u32;

    /// Read up to `max_len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at the end of the image.
    fn read_at(&mut self, offset: u32, max_len: usize) -> Result<Vec<u8>, SourceError>;
}

fn check_size(size: u64) -> Result<u32, SourceError> {
    u32::try_from(size).map_err(|_| SourceError::TooLarge { size })
}

/// Image read lazily from a file on disk.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u32,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let size = check_size(file.metadata()?.len())?;
        info!(path = %path.display(), size, "Opened firmware image");
        Ok(Self { file, size })
    }
}

impl ChunkSource for FileSource {
    fn size(&self) -> u32 {
        self.size
    }

    fn read_at(&mut self, offset: u32, max_len: usize) -> Result<Vec<u8>, SourceError> {
        if offset > self.size {
            return Err(SourceError::OutOfRange {
                offset,
                size: self.size,
            });
        }
        let len = max_len.min((self.size - offset) as usize);
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Image held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Result<Self, SourceError> {
        let data = data.into();
        check_size(data.len() as u64)?;
        Ok(Self { data })
    }
}

impl ChunkSource for MemorySource {
    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn read_at(&mut self, offset: u32, max_len: usize) -> Result<Vec<u8>, SourceError> {
        let start = offset as usize;
        if start > self.data.len() {
            return Err(SourceError::OutOfRange {
                offset,
                size: self.size(),
            });
        }
        let end = start + max_len.min(self.data.len() - start);
        Ok(self.data[start..end].to_vec())
    }
}

/// Where the image comes from before it has been opened.
#[derive(Debug, Clone)]
pub enum FirmwareLocation {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl FirmwareLocation {
    pub fn open(&self) -> Result<Box<dyn ChunkSource>, SourceError> {
        match self {
            FirmwareLocation::File(path) => Ok(Box::new(FileSource::open(path)?)),
            FirmwareLocation::Memory(data) => Ok(Box::new(MemorySource::new(data.clone())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_image(name: &str, data: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fwup-{}-{}.bin", name, std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_memory_source_reads() {
        let data: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        let mut src = MemorySource::new(data.clone()).unwrap();
        assert_eq!(src.size(), 300);
        assert_eq!(src.read_at(0, 128).unwrap(), &data[..128]);
        assert_eq!(src.read_at(256, 128).unwrap(), &data[256..]);
        assert!(src.read_at(300, 128).unwrap().is_empty());
        assert!(matches!(
            src.read_at(301, 1),
            Err(SourceError::OutOfRange { offset: 301, .. })
        ));
    }

    #[test]
    fn test_file_source_reads() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
        let path = temp_image("read", &data);

        let mut src = FileSource::open(&path).unwrap();
        assert_eq!(src.size(), 200);
        assert_eq!(src.read_at(128, 128).unwrap(), &data[128..]);
        assert_eq!(src.read_at(10, 5).unwrap(), &data[10..15]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_file_source_missing() {
        let err = FileSource::open("/nonexistent/fwup/image.bin").unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn test_location_open() {
        let loc = FirmwareLocation::Memory(Arc::from(vec![1u8, 2, 3]));
        let mut src = loc.open().unwrap();
        assert_eq!(src.size(), 3);
        assert_eq!(src.read_at(1, 10).unwrap(), vec![2, 3]);
    }
}
