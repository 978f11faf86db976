// SPDX-License-Identifier: GPL-3.0-only

//! Destinations for encoded output

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Byte sink receiving encoder output
///
/// Written from the encoder's delivery thread, finished from the
/// pipeline thread once the encoder has been torn down.
pub trait EncodedSink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flush and close; no writes follow
    fn finish(&mut self) -> io::Result<()>;
}

/// File on disk
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    /// Open for appending, creating the file if needed (video)
    pub fn append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_file(path, file))
    }

    /// Create or truncate (still images)
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: &Path, file: File) -> Self {
        debug!(path = %path.display(), "Output file opened");
        Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EncodedSink for FileSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(bytes),
            None => Err(io::Error::other("sink already finished")),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            debug!(path = %self.path.display(), "Output file closed");
        }
        Ok(())
    }
}

/// In-memory sink whose contents stay readable after the pipeline lets go
#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    finished: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EncodedSink for MemorySink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(bytes);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        *self.finished.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mmal-camera-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_append_keeps_existing_bytes() {
        let path = temp_path("append.h264");
        std::fs::write(&path, b"abc").unwrap();

        let mut sink = FileSink::append(&path).unwrap();
        sink.write_all(b"def").unwrap();
        sink.finish().unwrap();
        assert!(sink.write_all(b"x").is_err());

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_create_truncates() {
        let path = temp_path("still.jpg");
        std::fs::write(&path, b"old contents").unwrap();

        let mut sink = FileSink::create(&path).unwrap();
        sink.write_all(b"new").unwrap();
        sink.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_memory_sink_shared() {
        let sink = MemorySink::new();
        let mut writer: Box<dyn EncodedSink> = Box::new(sink.clone());
        writer.write_all(&[1, 2]).unwrap();
        writer.finish().unwrap();
        assert_eq!(sink.contents(), vec![1, 2]);
        assert!(sink.is_finished());
    }
}
