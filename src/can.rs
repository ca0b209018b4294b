//! SocketCAN endpoint wrapper: opens the interface, sends extended frames,
//! delivers inbound frames to a single callback and keeps I/O counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::BridgeError;
use crate::protocol::BusFrame;

/// Anything that can accept an outbound frame. Outputs hold this instead of
/// the concrete socket so command synthesis is testable off-bus.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: &BusFrame) -> Result<(), BridgeError>;
}

/// Counter snapshot for logging and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusCounters {
    pub received: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub suppressed: u64,
}

/// Minimum pause between reopen attempts when the adapter goes away
/// (unplugged USB adapter, interface taken down).
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

pub struct CanBus {
    // RwLock so the reader task and senders share the socket concurrently;
    // exclusive access is only taken to swap in a reopened socket.
    socket: RwLock<CanSocket>,
    interface: String,
    read_only: bool,
    received: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    suppressed: AtomicU64,
    stop: Notify,
    stopping: AtomicBool,
    last_reopen: Mutex<Instant>,
}

impl CanBus {
    /// Open the interface. With `read_only` set every send is counted and
    /// logged but never written to the bus.
    pub fn open(interface: &str, read_only: bool) -> Result<CanBus, BridgeError> {
        let socket = CanSocket::open(interface).map_err(|e| BridgeError::BusOpenFailed {
            interface: interface.to_string(),
            source: e,
        })?;
        Ok(CanBus {
            socket: RwLock::new(socket),
            interface: interface.to_string(),
            read_only,
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
            last_reopen: Mutex::new(Instant::now()),
        })
    }

    /// Try to replace a stale socket, rate-limited to one attempt per
    /// backoff window. Used after read errors that look like a vanished
    /// adapter rather than a lossy bus.
    async fn try_reopen(&self) {
        let mut last = self.last_reopen.lock().await;
        if last.elapsed() < REOPEN_BACKOFF {
            return;
        }
        *last = Instant::now();
        match CanSocket::open(&self.interface) {
            Ok(fresh) => {
                *self.socket.write().await = fresh;
                info!("reopened {}", self.interface);
            }
            Err(e) => warn!("reopen of {} failed: {e}", self.interface),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn counters(&self) -> BusCounters {
        BusCounters {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }

    /// Deliver inbound frames to `on_frame` until [`CanBus::shutdown`] is
    /// called. Read errors are logged and the loop keeps going; the frame
    /// space is lossy by design.
    pub async fn run<F>(&self, on_frame: F)
    where
        F: Fn(BusFrame) + Send + Sync,
    {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            let read = async {
                let socket = self.socket.read().await;
                socket.read_frame().await
            };
            tokio::select! {
                _ = self.stop.notified() => return,
                res = read => match res {
                    Ok(frame) => {
                        if let Some(bus_frame) = to_bus_frame(&frame) {
                            self.received.fetch_add(1, Ordering::Relaxed);
                            on_frame(bus_frame);
                        }
                    }
                    Err(e) => {
                        warn!("CAN read error on {}: {}", self.interface, e);
                        self.try_reopen().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    /// Ask a running [`CanBus::run`] loop to return.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }
}

#[async_trait]
impl FrameSink for CanBus {
    async fn send_frame(&self, frame: &BusFrame) -> Result<(), BridgeError> {
        if self.read_only {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "read-only: suppressed frame {:#010x} {:02X?}",
                frame.arb_id, frame.data
            );
            return Ok(());
        }

        // Commands must go out as extended 29-bit ids; a standard id would
        // silently truncate and the device ignores the frame.
        let id = ExtendedId::new(frame.arb_id).ok_or(BridgeError::BusFrameMalformed {
            arb_id: frame.arb_id,
            reason: "id exceeds 29 bits",
        })?;
        let can_frame =
            CanFrame::new(Id::Extended(id), &frame.data).ok_or(BridgeError::BusFrameMalformed {
                arb_id: frame.arb_id,
                reason: "payload exceeds 8 bytes",
            })?;

        let result = {
            let socket = self.socket.read().await;
            socket.write_frame(can_frame).await
        };
        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!("TX {:#010x} {:02X?}", frame.arb_id, frame.data);
                Ok(())
            }
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::BusSendFailed {
                    interface: self.interface.clone(),
                    source: e,
                })
            }
        }
    }
}

/// Convert an inbound socket frame. Standard-id and error frames are not
/// part of the Scheiber traffic we model and are dropped here.
fn to_bus_frame(frame: &CanFrame) -> Option<BusFrame> {
    match frame.id() {
        Id::Extended(id) => Some(BusFrame::new(id.as_raw(), frame.data())),
        Id::Standard(_) => None,
    }
}
