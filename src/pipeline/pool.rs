// SPDX-License-Identifier: GPL-3.0-only

//! Buffer pool bridge
//!
//! A [`BufferPool`] owns the idle headers of one output port. Callbacks
//! give every consumed header back through [`BufferPool::recycle`], which
//! queues it again on the port as long as the port is enabled. The pool
//! lock is never held across a hardware call.

use crate::backends::mmal::{BufferConfig, BufferHeader, ComponentKind, MmalHal, PoolId, PortId};
use crate::errors::{ConstructionStep, PipelineError, PipelineResult};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub struct BufferPool {
    hal: Arc<dyn MmalHal>,
    port: PortId,
    id: PoolId,
    idle: Mutex<VecDeque<BufferHeader>>,
    destroyed: AtomicBool,
}

impl BufferPool {
    /// Allocate the pool for `port`
    ///
    /// `stage` names the component the port belongs to for error reports.
    pub fn create(
        hal: &Arc<dyn MmalHal>,
        stage: ComponentKind,
        port: PortId,
        config: BufferConfig,
    ) -> PipelineResult<Arc<Self>> {
        let (id, buffers) = hal
            .pool_create(port, config.num, config.size)
            .map_err(|e| PipelineError::construction(stage, ConstructionStep::CreatePool, e))?;

        debug!(port = %port, num = config.num, size = config.size, "Buffer pool ready");
        Ok(Arc::new(Self {
            hal: Arc::clone(hal),
            port,
            id,
            idle: Mutex::new(buffers.into()),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<BufferHeader>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Headers currently sitting in the pool
    pub fn available(&self) -> usize {
        self.idle().len()
    }

    /// Queue every idle header on the port; returns how many were accepted
    pub fn prime(&self) -> usize {
        let mut sent = 0;
        while let Some(buffer) = self.take() {
            if !self.submit(buffer) {
                break;
            }
            sent += 1;
        }
        debug!(port = %self.port, sent, "Port primed");
        sent
    }

    /// Give a consumed header back, resubmitting it while the port runs
    pub fn recycle(&self, mut buffer: BufferHeader) {
        buffer.reset();
        self.idle().push_back(buffer);

        if self.destroyed.load(Ordering::SeqCst) || !self.hal.port_is_enabled(self.port) {
            return;
        }
        if let Some(buffer) = self.take() {
            self.submit(buffer);
        }
    }

    /// Return every header to the hardware and free the pool
    ///
    /// The port must already be disabled. Calling this twice is harmless.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let buffers: Vec<BufferHeader> = self.idle().drain(..).collect();
        if let Err(e) = self.hal.pool_destroy(self.id, buffers) {
            warn!(port = %self.port, error = %e, "Failed to destroy buffer pool");
        }
    }

    fn take(&self) -> Option<BufferHeader> {
        self.idle().pop_front()
    }

    /// Send one header; on refusal it goes back to the pool
    fn submit(&self, buffer: BufferHeader) -> bool {
        match self.hal.port_send_buffer(self.port, buffer) {
            Ok(()) => true,
            Err((buffer, e)) => {
                warn!(port = %self.port, error = %e, "Unable to return a buffer to the port");
                self.idle().push_back(buffer);
                false
            }
        }
    }
}

/// Owning handle of a pool
///
/// Callbacks hold plain `Arc<BufferPool>` clones; the handle is what
/// destroys the pool when the branch that created it goes away.
pub struct OwnedPool(Arc<BufferPool>);

impl OwnedPool {
    pub fn create(
        hal: &Arc<dyn MmalHal>,
        stage: ComponentKind,
        port: PortId,
        config: BufferConfig,
    ) -> PipelineResult<Self> {
        BufferPool::create(hal, stage, port, config).map(OwnedPool)
    }

    /// Shared reference for a port callback
    pub fn shared(&self) -> Arc<BufferPool> {
        Arc::clone(&self.0)
    }
}

impl Deref for OwnedPool {
    type Target = BufferPool;

    fn deref(&self) -> &BufferPool {
        &self.0
    }
}

impl Drop for OwnedPool {
    fn drop(&mut self) {
        self.0.destroy();
    }
}
