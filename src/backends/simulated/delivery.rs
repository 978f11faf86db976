// SPDX-License-Identifier: GPL-3.0-only
//! Paced delivery threads for simulated ports
//!
//! Every enabled output port of the simulator owns one [`DeliveryLoop`]
//! that wakes once per frame interval and pushes whatever the port has
//! produced into its callback.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Action returned by one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Keep delivering
    Continue,
    /// Port went away, end the thread
    Stop,
}

/// Handle of a delivery thread
///
/// Stopping wakes the thread out of its inter-frame sleep, so `stop`
/// returns within one iteration rather than one full interval.
pub struct DeliveryLoop {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl DeliveryLoop {
    /// Spawn a thread calling `tick` once per `interval`
    ///
    /// The thread sleeps first, so the first delivery happens one
    /// interval after start. Fails when the thread cannot be spawned.
    pub fn start<F>(name: &str, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        debug!(name = %name, interval_ms = interval.as_millis() as u64, "Starting delivery loop");

        let thread_handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                loop {
                    thread::park_timeout(interval);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if tick() == LoopAction::Stop {
                        debug!(name = %thread_name, "Delivery loop ended by port");
                        break;
                    }
                }
            })
            .inspect_err(|e| warn!(name = %name, error = %e, "Failed to spawn delivery thread"))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the thread and wait for it to finish
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            // Stopping from inside the loop itself must not self-join
            if handle.thread().id() == thread::current().id() {
                return;
            }
            handle.thread().unpark();
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Delivery thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for DeliveryLoop {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[test]
    fn test_loop_ends_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut delivery = DeliveryLoop::start("test-delivery", Duration::from_millis(1), move || {
            if counter_clone.fetch_add(1, Ordering::SeqCst) >= 4 {
                LoopAction::Stop
            } else {
                LoopAction::Continue
            }
        })
        .unwrap();

        while delivery.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        delivery.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_stop_interrupts_interval() {
        let mut delivery =
            DeliveryLoop::start("test-slow", Duration::from_secs(30), || LoopAction::Continue)
                .unwrap();
        assert!(delivery.is_running());

        let started = Instant::now();
        delivery.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!delivery.is_running());
    }

    #[test]
    fn test_drop_stops_loop() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let delivery = DeliveryLoop::start("test-drop", Duration::from_millis(1), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            LoopAction::Continue
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(delivery);

        let after_drop = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after_drop);
    }
}
