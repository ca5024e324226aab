//! Serial link to the radio adapter.
//!
//! A supervisor task owns the port. It opens it, pumps frames in both
//! directions, and on any I/O failure closes the link, reports
//! [`LinkEvent::Disconnected`] and reopens with jittered exponential backoff.
//! If the link stays down longer than the configured maximum outage the
//! supervisor reports [`LinkEvent::Lost`] and stops.
//!
//! Sends never wait for the port: while the link is closed they fail fast
//! with [`TransportError::Closed`] so the caller can retry at its own level.
//! Messages that were accepted but never written when the port failed are
//! handed back in [`LinkEvent::Undelivered`], ahead of the disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use zigbridge_common::{Backoff, BackoffConfig};

use super::TransportError;
use super::frame::{FrameDecoder, encode_frame};
use super::message::RadioMessage;

/// Frames accepted for writing while the port is busy.
const SEND_QUEUE: usize = 64;

/// Something radio messages can be sent to.
pub trait RadioSink: Send {
    fn send(&self, message: &RadioMessage) -> Result<(), TransportError>;
}

/// Events produced by the link supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The port was (re)opened.
    Connected,
    /// The port failed and was closed.
    Disconnected { reason: String },
    /// A decoded adapter message.
    Frame(RadioMessage),
    /// Messages accepted by [`LinkHandle::send`] that never reached the port,
    /// in send order.
    Undelivered(Vec<RadioMessage>),
    /// The link stayed down past the maximum outage; the supervisor stopped.
    Lost { outage: Duration },
}

/// Link supervisor settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    pub backoff: BackoffConfig,
    pub max_outage: Duration,
}

/// Open the serial port.
pub fn open(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream, TransportError> {
    let builder = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None);

    tokio_serial::SerialStream::open(&builder).map_err(|e| TransportError::Open {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// A message waiting for the port, kept alongside its frame so a loss can be
/// reported by content.
#[derive(Debug)]
struct Queued {
    message: RadioMessage,
    frame: Vec<u8>,
}

/// Cloneable sending side of the link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<Queued>,
    open: Arc<AtomicBool>,
}

impl LinkHandle {
    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl RadioSink for LinkHandle {
    fn send(&self, message: &RadioMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(&message.encode())?;
        let queued = Queued {
            message: message.clone(),
            frame,
        };
        self.tx.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })?;
        trace!(kind = message.kind(), "Radio message queued");
        Ok(())
    }
}

/// A supervised link: its send handle plus the stream of link events.
pub struct Link {
    handle: LinkHandle,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    task: JoinHandle<()>,
}

impl Link {
    /// Supervise the configured serial port.
    pub fn spawn(config: LinkConfig, cancel: CancellationToken) -> Self {
        let port = config.port.clone();
        let baud_rate = config.baud_rate;
        Self::spawn_with(move || open(&port, baud_rate), config, cancel)
    }

    /// Supervise any byte stream produced by `opener`.
    pub fn spawn_with<O, S>(opener: O, config: LinkConfig, cancel: CancellationToken) -> Self
    where
        O: FnMut() -> Result<S, TransportError> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, outgoing) = mpsc::channel(SEND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(supervise(
            opener,
            config,
            open.clone(),
            outgoing,
            events_tx,
            cancel,
        ));

        Self {
            handle: LinkHandle { tx, open },
            events,
            task,
        }
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Next link event. `None` once the supervisor has stopped.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        LinkHandle,
        mpsc::UnboundedReceiver<LinkEvent>,
        JoinHandle<()>,
    ) {
        (self.handle, self.events, self.task)
    }
}

async fn supervise<O, S>(
    mut opener: O,
    config: LinkConfig,
    open: Arc<AtomicBool>,
    mut outgoing: mpsc::Receiver<Queued>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) where
    O: FnMut() -> Result<S, TransportError>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut backoff = Backoff::new(config.backoff);
    let mut outage_since: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match opener() {
            Ok(stream) => {
                if backoff.attempts() > 0 {
                    info!(port = %config.port, attempts = backoff.attempts(), "Radio link restored");
                } else {
                    info!(port = %config.port, baud_rate = config.baud_rate, "Radio link open");
                }
                backoff.reset();
                outage_since = None;

                // Sends that raced the last close were accepted by a dead port.
                let stale = drain_undelivered(&mut outgoing, None);
                if !stale.is_empty() && events.send(LinkEvent::Undelivered(stale)).is_err() {
                    break;
                }

                open.store(true, Ordering::Release);
                if events.send(LinkEvent::Connected).is_err() {
                    break;
                }

                let failure = pump(stream, &mut outgoing, &events, &cancel).await;
                open.store(false, Ordering::Release);

                match failure {
                    Some(PumpFailure { reason, unsent }) => {
                        warn!(port = %config.port, reason = %reason, "Radio link lost");
                        let undelivered = drain_undelivered(&mut outgoing, unsent);
                        if !undelivered.is_empty()
                            && events.send(LinkEvent::Undelivered(undelivered)).is_err()
                        {
                            break;
                        }
                        if events.send(LinkEvent::Disconnected { reason }).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Err(e) => {
                debug!(port = %config.port, attempt = backoff.attempts(), error = %e, "Radio link open failed");
            }
        }

        let outage = outage_since.get_or_insert_with(Instant::now).elapsed();
        if outage >= config.max_outage {
            error!(
                port = %config.port,
                outage_secs = outage.as_secs(),
                "Radio link unavailable past maximum outage"
            );
            let _ = events.send(LinkEvent::Lost { outage });
            break;
        }

        let delay = backoff.next_delay();
        debug!(retry_in_ms = delay.as_millis() as u64, "Reopening radio link");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    open.store(false, Ordering::Release);
    debug!(port = %config.port, "Radio link supervisor stopped");
}

/// Why the pump stopped, and the message it was writing if any.
struct PumpFailure {
    reason: String,
    unsent: Option<RadioMessage>,
}

impl PumpFailure {
    fn new(reason: impl Into<String>, unsent: Option<RadioMessage>) -> Self {
        Self {
            reason: reason.into(),
            unsent,
        }
    }
}

/// Collect everything still queued for a port that is gone.
fn drain_undelivered(
    outgoing: &mut mpsc::Receiver<Queued>,
    unsent: Option<RadioMessage>,
) -> Vec<RadioMessage> {
    let mut undelivered: Vec<RadioMessage> = unsent.into_iter().collect();
    while let Ok(queued) = outgoing.try_recv() {
        undelivered.push(queued.message);
    }
    for message in &undelivered {
        warn!(kind = message.kind(), "Radio message not delivered");
    }
    undelivered
}

/// Move bytes until the stream fails. Returns `None` on cancellation.
async fn pump<S>(
    stream: S,
    outgoing: &mut mpsc::Receiver<Queued>,
    events: &mpsc::UnboundedSender<LinkEvent>,
    cancel: &CancellationToken,
) -> Option<PumpFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return Some(PumpFailure::new("end of stream", None)),
                Ok(n) => {
                    for payload in decoder.push(&buf[..n]) {
                        match RadioMessage::decode(&payload) {
                            Ok(message) => {
                                trace!(kind = message.kind(), "Radio message received");
                                if events.send(LinkEvent::Frame(message)).is_err() {
                                    return None;
                                }
                            }
                            Err(e) => warn!(error = %e, "Discarding malformed adapter message"),
                        }
                    }
                }
                Err(e) => return Some(PumpFailure::new(e.to_string(), None)),
            },
            queued = outgoing.recv() => match queued {
                Some(Queued { message, frame }) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        return Some(PumpFailure::new(e.to_string(), Some(message)));
                    }
                    if let Err(e) = writer.flush().await {
                        return Some(PumpFailure::new(e.to_string(), Some(message)));
                    }
                }
                None => return None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShortAddress;

    fn config(max_outage: Duration) -> LinkConfig {
        LinkConfig {
            port: "test".to_string(),
            baud_rate: 115_200,
            backoff: BackoffConfig {
                base_ms: 1,
                max_ms: 2,
            },
            max_outage,
        }
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways_and_loss_is_reported() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut streams = vec![local];
        let opener = move || {
            streams.pop().ok_or_else(|| TransportError::Open {
                path: "test".to_string(),
                message: "unplugged".to_string(),
            })
        };

        let mut link = Link::spawn_with(opener, config(Duration::ZERO), CancellationToken::new());
        assert_eq!(link.next_event().await, Some(LinkEvent::Connected));

        let announce = RadioMessage::LeaveIndication {
            nwk: ShortAddress(5),
        };
        remote
            .write_all(&encode_frame(&announce.encode()).unwrap())
            .await
            .unwrap();
        assert_eq!(link.next_event().await, Some(LinkEvent::Frame(announce)));

        let handle = link.handle();
        assert!(handle.is_open());
        let request = RadioMessage::EndpointsRequest {
            nwk: ShortAddress(5),
        };
        handle.send(&request).unwrap();
        let expected = encode_frame(&request.encode()).unwrap();
        let mut received = vec![0u8; expected.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(remote);
        assert!(matches!(
            link.next_event().await,
            Some(LinkEvent::Disconnected { .. })
        ));
        assert!(matches!(link.next_event().await, Some(LinkEvent::Lost { .. })));
        assert!(matches!(handle.send(&request), Err(TransportError::Closed)));
        assert_eq!(link.next_event().await, None);
    }

    #[tokio::test]
    async fn test_queued_sends_are_reported_when_port_fails() {
        let (local, remote) = tokio::io::duplex(1024);
        let mut streams = vec![local];
        let opener = move || streams.pop().ok_or(TransportError::Closed);
        let mut link = Link::spawn_with(
            opener,
            config(Duration::from_secs(3600)),
            CancellationToken::new(),
        );
        assert_eq!(link.next_event().await, Some(LinkEvent::Connected));

        let handle = link.handle();
        let queued = vec![
            RadioMessage::RevokeAddress {
                nwk: ShortAddress(7),
            },
            RadioMessage::EndpointsRequest {
                nwk: ShortAddress(8),
            },
            RadioMessage::PermitJoin { duration: 0 },
        ];
        for message in &queued {
            handle.send(message).unwrap();
        }
        drop(remote);

        assert_eq!(link.next_event().await, Some(LinkEvent::Undelivered(queued)));
        assert!(matches!(
            link.next_event().await,
            Some(LinkEvent::Disconnected { .. })
        ));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_send_while_never_opened_fails_fast() {
        let opener = || -> Result<tokio::io::DuplexStream, TransportError> {
            Err(TransportError::Closed)
        };
        let link = Link::spawn_with(
            opener,
            config(Duration::from_secs(3600)),
            CancellationToken::new(),
        );
        let result = link.handle().send(&RadioMessage::PermitJoin { duration: 0 });
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_cancel_stops_supervisor() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut streams = vec![local];
        let opener = move || streams.pop().ok_or(TransportError::Closed);
        let cancel = CancellationToken::new();
        let mut link = Link::spawn_with(opener, config(Duration::from_secs(3600)), cancel.clone());
        assert_eq!(link.next_event().await, Some(LinkEvent::Connected));

        cancel.cancel();
        let (handle, mut events, task) = link.into_parts();
        task.await.unwrap();
        assert!(!handle.is_open());
        assert_eq!(events.recv().await, None);
    }
}
