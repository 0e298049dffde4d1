//! Log forwarding for realtime threads.
//!
//! Realtime code must not format strings or take the logger's locks. It posts a
//! fixed [`RtMessage`] into a bounded queue instead; a background thread drains
//! the queue into `tracing`. A full queue drops the message and counts it.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Queue capacity.
pub const MESSAGE_CAPACITY: usize = 256;

/// Severity of a realtime message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtLevel {
    /// Debug detail.
    Debug,
    /// Informational.
    Info,
    /// Something went wrong but processing continues.
    Warn,
    /// Something failed.
    Error,
}

/// A message posted from a realtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtMessage {
    /// Severity.
    pub level: RtLevel,
    /// Static text; no formatting happens on the realtime side.
    pub text: &'static str,
    /// One numeric detail (a refnum, a count).
    pub value: i64,
}

enum Envelope {
    Message(RtMessage),
    Shutdown,
}

struct Inner {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    dropped: AtomicU64,
    forwarded: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded realtime-safe log queue.
///
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("pending", &self.inner.rx.len())
            .field("dropped", &self.dropped())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MessageBuffer {
    /// Creates a buffer. Messages queue up until [`create`](Self::create) starts
    /// the drain thread.
    pub fn new() -> Self {
        let (tx, rx) = bounded(MESSAGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                dropped: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Starts the drain thread. Does nothing if it is already running.
    pub fn create(&self) -> std::io::Result<()> {
        let mut thread = self.inner.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("cadence-messages".to_string())
            .spawn(move || {
                while let Ok(envelope) = inner.rx.recv() {
                    match envelope {
                        Envelope::Message(msg) => {
                            forward(msg);
                            inner.forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Envelope::Shutdown => break,
                    }
                }
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Flushes pending messages and stops the drain thread.
    pub fn destroy(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            // The shutdown marker queues behind pending messages, so they flush first.
            if self.inner.tx.send(Envelope::Shutdown).is_ok() && handle.join().is_err() {
                tracing::error!("message buffer thread panicked");
            }
        }
        // Whatever arrived after the marker is forwarded here.
        while let Ok(envelope) = self.inner.rx.try_recv() {
            if let Envelope::Message(msg) = envelope {
                forward(msg);
                self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Posts a message without blocking.
    pub fn post(&self, level: RtLevel, text: &'static str, value: i64) {
        let msg = RtMessage { level, text, value };
        match self.inner.tx.try_send(Envelope::Message(msg)) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Messages lost because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Messages handed to `tracing` so far.
    pub fn forwarded(&self) -> u64 {
        self.inner.forwarded.load(Ordering::Relaxed)
    }

    /// Whether the drain thread is running.
    pub fn is_running(&self) -> bool {
        self.inner.thread.lock().is_some()
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn forward(msg: RtMessage) {
    match msg.level {
        RtLevel::Debug => tracing::debug!(value = msg.value, "{}", msg.text),
        RtLevel::Info => tracing::info!(value = msg.value, "{}", msg.text),
        RtLevel::Warn => tracing::warn!(value = msg.value, "{}", msg.text),
        RtLevel::Error => tracing::error!(value = msg.value, "{}", msg.text),
    }
}
