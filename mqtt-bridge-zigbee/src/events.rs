//! Router intake: the single ordered queue every input goes through.
//!
//! Reader tasks submit link and bus events, timers submit synthetic events
//! after a delay. Once shutdown starts the intake stops accepting new input
//! and a final [`Event::Shutdown`] is enqueued behind everything already
//! queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use zigbridge_framework::BusMessage;

use crate::transport::LinkEvent;

/// Timer events scheduled by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// A transaction's response deadline passed.
    TransactionTimeout { seq: u8, attempt: u8 },
    /// The delay before resending a transaction elapsed.
    RetryDue { seq: u8, attempt: u8 },
    /// Periodic check for silent devices.
    OfflineSweep,
    /// The permit-join window of this generation ends.
    PermitJoinExpired { generation: u64 },
}

/// Everything the router reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Link(LinkEvent),
    Bus(BusMessage),
    Timer(TimerEvent),
    Shutdown,
}

/// Schedules timer events.
pub trait Scheduler: Send {
    fn schedule(&self, after: Duration, event: TimerEvent);
}

/// Sending side of the intake queue.
#[derive(Debug, Clone)]
pub struct Intake {
    tx: mpsc::Sender<Event>,
    accepting: Arc<AtomicBool>,
}

impl Intake {
    /// Create an intake with a bounded queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                accepting: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Enqueue an event, waiting for space. Returns false once shutdown has
    /// started or the router is gone.
    pub async fn submit(&self, event: Event) -> bool {
        if !self.is_accepting() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Stop accepting input and enqueue the final shutdown event.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            debug!("Intake closed, enqueueing shutdown");
            if self.tx.send(Event::Shutdown).await.is_err() {
                warn!("Router already stopped before shutdown");
            }
        }
    }
}

impl Scheduler for Intake {
    fn schedule(&self, after: Duration, event: TimerEvent) {
        let intake = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if !intake.submit(Event::Timer(event)).await {
                debug!(?event, "Timer dropped, intake closed");
            }
        });
    }
}
