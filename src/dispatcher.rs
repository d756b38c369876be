//! Decouples the connection's receive loop from user notification callbacks.
//!
//! The receive loop copies raw notification bytes into a per-virtual-
//!  connection ring buffer and signals the dispatcher; a dedicated worker
//!  task replays them to the registered callbacks. The receive loop therefore
//!  never blocks on user code, and delivery within one dispatcher is strictly
//!  arrival-ordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffers::ring_buffer::RingBuffer;
use crate::net_id::AmsAddr;

/// The single internal callback type all external calling conventions are
///  adapted to: `(source address, timestamp, sample bytes)`.
pub type NotificationCallback = Arc<dyn Fn(&AmsAddr, u64, &[u8]) + Send + Sync>;

/// One active subscription.
#[derive(Clone)]
pub struct Notification {
    pub callback: NotificationCallback,
    /// Sample size declared when the subscription was created. Samples with
    ///  a different size are dropped without invoking the callback.
    pub sample_size: u32,
}

/// Per-virtual-connection notification pipeline: a ring buffer filled by the
///  receive loop and drained by one worker task.
pub struct NotificationDispatcher {
    remote: AmsAddr,
    ring: Mutex<RingBuffer>,
    signal: Notify,
    running: AtomicBool,
    notifications: Mutex<FxHashMap<u32, Notification>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    /// Create the dispatcher and spawn its worker task.
    pub fn start(remote: AmsAddr, ring_capacity: usize) -> Arc<NotificationDispatcher> {
        let dispatcher = Arc::new(NotificationDispatcher {
            remote,
            ring: Mutex::new(RingBuffer::new(ring_capacity)),
            signal: Notify::new(),
            running: AtomicBool::new(true),
            notifications: Mutex::new(FxHashMap::default()),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run(dispatcher.clone()));
        *dispatcher.worker.lock().unwrap() = Some(handle);
        dispatcher
    }

    pub fn register(&self, handle: u32, notification: Notification) {
        self.notifications.lock().unwrap().insert(handle, notification);
    }

    /// Stop local delivery for `handle`. Returns false if the handle was
    ///  never registered (or already removed).
    pub fn unregister(&self, handle: u32) -> bool {
        self.notifications.lock().unwrap().remove(&handle).is_some()
    }

    /// Called by the receive loop with the raw bytes of one notification
    ///  frame. Returns false (dropping the frame) when the ring buffer lacks
    ///  room for the frame plus its length prefix.
    pub fn enqueue(&self, frame: &[u8]) -> bool {
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.bytes_free() < frame.len() + 4 {
                warn!("notification ring buffer for {} full, dropping frame", self.remote);
                return false;
            }
            ring.write(&(frame.len() as u32).to_le_bytes());
            ring.write(frame);
        }
        self.signal.notify_one();
        true
    }

    /// Signal the worker to exit and wait for it.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.signal.notify_one();

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
    }

    async fn run(self: Arc<NotificationDispatcher>) {
        debug!("starting notification dispatcher for {}", self.remote);
        loop {
            self.signal.notified().await;
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            // the producer only ever writes whole frames, so everything up
            //  to the current write cursor can be replayed immediately
            loop {
                let deliveries = {
                    let mut ring = self.ring.lock().unwrap();
                    if ring.bytes_available() < 4 {
                        break;
                    }
                    let frame_length = ring.read_u32_le() as usize;
                    self.parse_frame(&mut ring, frame_length)
                };
                // the ring lock is released here: the receive loop must not
                //  contend with user callbacks
                for (notification, timestamp, sample) in deliveries {
                    (notification.callback)(&self.remote, timestamp, &sample);
                }
            }
        }
        debug!("notification dispatcher for {} shut down", self.remote);
    }

    /// Consume one notification frame off the ring: a count of timestamp
    ///  groups, per group a timestamp plus a count of samples, per sample a
    ///  handle, a declared size and the raw payload.
    fn parse_frame(&self, ring: &mut RingBuffer, frame_length: usize) -> Vec<(Notification, u64, Vec<u8>)> {
        let mut deliveries = Vec::new();
        let mut remaining = frame_length;

        let stamp_count = ring.read_u32_le();
        remaining = remaining.saturating_sub(4);
        for _ in 0..stamp_count {
            let timestamp = ring.read_u64_le();
            let sample_count = ring.read_u32_le();
            remaining = remaining.saturating_sub(12);
            for _ in 0..sample_count {
                let handle = ring.read_u32_le();
                let size = ring.read_u32_le();
                remaining = remaining.saturating_sub(8);

                let notification = self.notifications.lock().unwrap().get(&handle).cloned();
                match notification {
                    Some(notification) if notification.sample_size == size => {
                        let mut sample = vec![0u8; size as usize];
                        ring.read_into(&mut sample);
                        remaining = remaining.saturating_sub(size as usize);
                        deliveries.push((notification, timestamp, sample));
                    }
                    Some(notification) => {
                        // a corrupt size would desynchronize the sample
                        //  stream, abandon the rest of this frame
                        warn!(
                            "notification sample size {} doesn't match registered size {}, discarding rest of frame",
                            size, notification.sample_size
                        );
                        ring.skip(remaining);
                        return deliveries;
                    }
                    None => {
                        // already unsubscribed, skip its payload only; a
                        //  lying size must not cross into the next frame
                        let skip = usize::min(size as usize, remaining);
                        ring.skip(skip);
                        remaining -= skip;
                    }
                }
            }
        }
        if remaining > 0 {
            warn!("notification frame with {} trailing bytes, discarding them", remaining);
            ring.skip(remaining);
        }
        deliveries
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}
