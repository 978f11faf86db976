// SPDX-License-Identifier: GPL-3.0-only

//! Port callbacks for each branch role
//!
//! Every callback consumes the payload first and then hands the header
//! back to its pool, which resubmits it while the port is still enabled.

use super::pool::BufferPool;
use super::rendezvous::Rendezvous;
use super::sink::EncodedSink;
use crate::backends::mmal::{BufferFlags, BufferHeader, PortCallback};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Raw preview frames go to the rendezvous
pub fn preview(pool: Arc<BufferPool>, rendezvous: Arc<Rendezvous>) -> PortCallback {
    Arc::new(move |buffer: BufferHeader| {
        if !buffer.is_empty() {
            rendezvous.offer(buffer.payload());
        }
        pool.recycle(buffer);
    })
}

/// Side information is encoder bookkeeping, never part of the stream
fn is_stream_data(buffer: &BufferHeader) -> bool {
    !buffer.is_empty() && !buffer.flags().contains(BufferFlags::CODECSIDEINFO)
}

/// Recording state shared between the encoder callback and the pipeline
pub struct RecordTap {
    sink: Mutex<Option<Box<dyn EncodedSink>>>,
    bytes_written: AtomicU64,
    write_failed: AtomicBool,
}

impl RecordTap {
    pub fn new(sink: Box<dyn EncodedSink>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            bytes_written: AtomicU64::new(0),
            write_failed: AtomicBool::new(false),
        }
    }

    fn sink(&self) -> MutexGuard<'_, Option<Box<dyn EncodedSink>>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    fn write(&self, bytes: &[u8]) {
        let mut sink = self.sink();
        let Some(sink) = sink.as_mut() else {
            return;
        };
        match sink.write_all(bytes) {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(bytes.len() as u64, Ordering::SeqCst);
            }
            Err(e) => {
                // Only the first failure is worth a warning
                if !self.write_failed.swap(true, Ordering::SeqCst) {
                    warn!(error = %e, "Failed to write encoded video");
                }
            }
        }
    }

    /// Detach the sink once the encoder no longer delivers
    pub fn take_sink(&self) -> Option<Box<dyn EncodedSink>> {
        self.sink().take()
    }
}

/// Encoded video goes straight to the sink
pub fn record(pool: Arc<BufferPool>, tap: Arc<RecordTap>) -> PortCallback {
    Arc::new(move |buffer: BufferHeader| {
        if is_stream_data(&buffer) {
            tap.write(buffer.payload());
        }
        pool.recycle(buffer);
    })
}

/// Still image assembly shared between the encoder callback and the caller
pub struct StillTap {
    image: Mutex<Vec<u8>>,
    rendezvous: Rendezvous,
}

impl StillTap {
    pub fn new(rendezvous: Rendezvous) -> Self {
        Self {
            image: Mutex::new(Vec::new()),
            rendezvous,
        }
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    fn image(&self) -> MutexGuard<'_, Vec<u8>> {
        self.image.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop any partial image left over from an earlier attempt
    pub fn reset(&self) {
        self.image().clear();
    }

    fn append(&self, buffer: &BufferHeader) {
        let mut image = self.image();
        if is_stream_data(buffer) {
            image.extend_from_slice(buffer.payload());
        }
        if buffer
            .flags()
            .intersects(BufferFlags::FRAME_END | BufferFlags::EOS)
            && !image.is_empty()
        {
            debug!(bytes = image.len(), "Still image complete");
            self.rendezvous.offer(&image);
            image.clear();
        }
    }
}

/// Encoded image chunks accumulate until the frame end
pub fn still(pool: Arc<BufferPool>, tap: Arc<StillTap>) -> PortCallback {
    Arc::new(move |buffer: BufferHeader| {
        tap.append(&buffer);
        pool.recycle(buffer);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mmal::PoolId;
    use crate::pipeline::rendezvous::FrameEvent;
    use crate::pipeline::sink::MemorySink;

    fn buffer(bytes: &[u8], flags: BufferFlags) -> BufferHeader {
        let mut buffer = BufferHeader::new(PoolId(1), 0, 64);
        buffer.fill(bytes);
        buffer.set_flags(flags);
        buffer
    }

    #[test]
    fn test_record_tap_skips_side_info() {
        let sink = MemorySink::new();
        let tap = RecordTap::new(Box::new(sink.clone()));

        for b in [
            buffer(b"head", BufferFlags::CONFIG),
            buffer(b"side", BufferFlags::CODECSIDEINFO),
            buffer(b"pic", BufferFlags::FRAME_END),
        ] {
            if is_stream_data(&b) {
                tap.write(b.payload());
            }
        }

        assert_eq!(sink.contents(), b"headpic");
        assert_eq!(tap.bytes_written(), 7);
        assert!(tap.take_sink().is_some());
        assert!(tap.take_sink().is_none());
    }

    #[test]
    fn test_still_tap_completes_on_frame_end() {
        let tap = StillTap::new(Rendezvous::new(FrameEvent::EncodeComplete));
        tap.rendezvous().arm();

        tap.append(&buffer(&[0xFF, 0xD8], BufferFlags::empty()));
        tap.append(&buffer(b"side", BufferFlags::CODECSIDEINFO));
        assert_eq!(tap.rendezvous().held_len(), 0);

        tap.append(&buffer(&[0xFF, 0xD9], BufferFlags::FRAME_END));
        assert!(tap.rendezvous().wait());
        assert_eq!(tap.rendezvous().take(), Some(vec![0xFF, 0xD8, 0xFF, 0xD9]));
    }
}
