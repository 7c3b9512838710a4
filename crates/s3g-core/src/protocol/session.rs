//! Exclusive channel and command/retry engine
//!
//! Every exchange (write one frame, read until one frame is decoded) runs
//! under a single lock, so frames from concurrent callers never interleave.

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{
    capture::CaptureSink, transport::Transport, Packet, PacketDecoder, ProtocolError, Response,
    ResponseCode, MIN_FRAME_SIZE,
};

/// Pause before clearing the channel after an abandoned exchange, long enough
/// for the tail of an in-flight frame to arrive
const DRAIN_DELAY: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag shared between a session and its callers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; sticky until the token is dropped
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set
    pub fn reset(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// How failed exchanges are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Up to N attempts, logging every failure and the final exhaustion
    Logged(u32),
    /// Up to N attempts with no logging; for probes where silence is expected
    Silent(u32),
    /// Keep trying until a frame arrives or the session is cancelled
    UntilCancelled,
}

impl RetryPolicy {
    fn budget(self) -> Option<u32> {
        match self {
            RetryPolicy::Logged(n) | RetryPolicy::Silent(n) => Some(n),
            RetryPolicy::UntilCancelled => None,
        }
    }

    fn logs(self) -> bool {
        !matches!(self, RetryPolicy::Silent(_))
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Writing to the transport failed
    WriteFailed,
    /// No frame within the timeout
    ReadTimeout,
    /// Reply failed its CRC
    BadChecksum,
    /// Board answered with a retryable status
    DeviceError(ResponseCode),
}

/// Outcome of a single write/read exchange
#[derive(Debug)]
enum Attempt {
    Done(Response),
    Retry {
        reason: RetryReason,
        response: Option<Response>,
    },
    BufferFull,
    Cancelled,
}

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Packets written
    pub tx_packets: u64,
    /// Bytes written
    pub tx_bytes: u64,
    /// Frames received
    pub rx_packets: u64,
    /// Attempts that were retried
    pub failed_attempts: u64,
    /// Packets recorded while capturing
    pub captured_packets: u64,
}

struct Link {
    transport: Option<Box<dyn Transport>>,
    capture: Option<CaptureSink>,
    stats: SessionStats,
}

/// Owns the transport; all device traffic goes through here
pub struct Session {
    link: Mutex<Link>,
    cancel: CancelToken,
}

impl Session {
    /// Session over an open transport
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            link: Mutex::new(Link {
                transport: Some(Box::new(transport)),
                capture: None,
                stats: SessionStats::default(),
            }),
            cancel: CancelToken::new(),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle used to cancel in-flight and future exchanges
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether a transport is still attached
    pub fn is_open(&self) -> bool {
        self.link().transport.is_some()
    }

    /// Release the transport; subsequent exchanges time out immediately
    pub fn close(&self) {
        self.link().transport = None;
    }

    /// Traffic counters so far
    pub fn stats(&self) -> SessionStats {
        self.link().stats
    }

    /// `None` waits forever
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        match self.link().transport.as_mut() {
            Some(t) => t.set_timeout(timeout),
            None => Err(ProtocolError::NotConnected),
        }
    }

    /// Drop unread input
    pub fn clear(&self) -> Result<(), ProtocolError> {
        match self.link().transport.as_mut() {
            Some(t) => t.clear(),
            None => Err(ProtocolError::NotConnected),
        }
    }

    /// Pulse the reset line
    pub fn pulse_reset(&self) -> Result<(), ProtocolError> {
        match self.link().transport.as_mut() {
            Some(t) => t.pulse_reset(),
            None => Err(ProtocolError::NotConnected),
        }
    }

    /// Start recording commands to a file instead of the device
    pub fn begin_capture(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let sink = CaptureSink::create(path)?;
        let mut link = self.link();
        if let Some(previous) = link.capture.replace(sink) {
            previous.finish()?;
        }
        Ok(())
    }

    /// Stop recording; returns the number of bytes written
    pub fn end_capture(&self) -> Result<usize, ProtocolError> {
        match self.link().capture.take() {
            Some(sink) => sink.finish(),
            None => Ok(0),
        }
    }

    /// Commands are being recorded instead of sent
    pub fn is_capturing(&self) -> bool {
        self.link().capture.is_some()
    }

    /// Send a query. Queries are never buffered, so a buffer-full answer is an
    /// invariant violation reported as [`ProtocolError::QueryRejected`].
    pub fn run_query(&self, packet: &Packet, policy: RetryPolicy) -> Result<Response, ProtocolError> {
        match self.run_command(packet, policy) {
            Err(ProtocolError::BufferFull) => {
                let code = packet.code().unwrap_or_default();
                error!(code, "query answered with buffer-full");
                Err(ProtocolError::QueryRejected { code })
            }
            other => other,
        }
    }

    /// Send one packet and wait for one response, retrying per `policy`.
    ///
    /// Transport timeouts, checksum faults and non-OK device answers consume
    /// the budget; once it is spent a timeout response (or the last device
    /// answer) is returned. A buffer-full answer is returned as
    /// [`ProtocolError::BufferFull`] without retrying. Cancellation yields an
    /// empty timeout response.
    pub fn run_command(&self, packet: &Packet, policy: RetryPolicy) -> Result<Response, ProtocolError> {
        if policy.budget() == Some(0) {
            if policy.logs() {
                error!("packet timed out");
            }
            return Ok(Response::timeout());
        }
        if packet.encoded_size() < MIN_FRAME_SIZE {
            error!(
                len = packet.encoded_size(),
                "attempt to send empty or too-small packet"
            );
            return Err(ProtocolError::PacketTooShort(packet.encoded_size()));
        }

        let mut link = self.link();
        let Link {
            transport,
            capture,
            stats,
        } = &mut *link;

        if let Some(sink) = capture.as_mut() {
            if sink.record(packet)? {
                stats.captured_packets += 1;
            }
            return Ok(Response::ok());
        }

        // Happens while shutting down
        let Some(transport) = transport.as_mut() else {
            return Ok(Response::timeout());
        };

        if self.cancel.is_cancelled() {
            return Ok(Response::timeout());
        }

        let mut remaining = policy.budget();
        loop {
            let attempt = self.attempt(transport.as_mut(), packet, stats);
            let (reason, response) = match attempt {
                Attempt::Done(response) => return Ok(response),
                Attempt::BufferFull => return Err(ProtocolError::BufferFull),
                Attempt::Cancelled => {
                    drain(transport.as_mut());
                    return Ok(Response::timeout());
                }
                Attempt::Retry { reason, response } => (reason, response),
            };
            stats.failed_attempts += 1;

            if let Some(left) = remaining.as_mut() {
                *left -= 1;
                if *left == 0 {
                    if policy.logs() {
                        error!(?reason, "packet timed out; retries exhausted");
                    }
                    return Ok(response.unwrap_or_else(Response::timeout));
                }
                if policy.logs() {
                    warn!(?reason, retries_remaining = *left, "exchange failed; retrying");
                }
            } else {
                debug!(?reason, "exchange failed; retrying until cancelled");
            }

            if self.cancel.is_cancelled() {
                drain(transport.as_mut());
                return Ok(Response::timeout());
            }
        }
    }

    /// One write followed by a read of one complete frame
    fn attempt(&self, transport: &mut dyn Transport, packet: &Packet, stats: &mut SessionStats) -> Attempt {
        let bytes = packet.as_bytes();
        if let Err(e) = transport.write(bytes) {
            debug!("write failed: {}", e);
            return Attempt::Retry {
                reason: RetryReason::WriteFailed,
                response: None,
            };
        }
        stats.tx_packets += 1;
        stats.tx_bytes += bytes.len() as u64;
        debug!("OUT: {:02x?}", bytes);

        let mut decoder = PacketDecoder::new();
        loop {
            let byte = match transport.read_byte() {
                Ok(Some(b)) => b,
                Ok(None) | Err(_) => {
                    if self.cancel.is_cancelled() {
                        return Attempt::Cancelled;
                    }
                    return Attempt::Retry {
                        reason: RetryReason::ReadTimeout,
                        response: None,
                    };
                }
            };
            match decoder.push(byte) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    debug!("{}", e);
                    return Attempt::Retry {
                        reason: RetryReason::BadChecksum,
                        response: None,
                    };
                }
            }
        }

        let payload = decoder.take_payload().unwrap_or_default();
        debug!("IN: {:02x?}", payload);
        stats.rx_packets += 1;
        let response = Response::from_payload(&payload);
        match response.code() {
            ResponseCode::Ok => Attempt::Done(response),
            ResponseCode::BufferOverflow => Attempt::BufferFull,
            code => {
                debug!(?code, "device answered with an error");
                Attempt::Retry {
                    reason: RetryReason::DeviceError(code),
                    response: Some(response),
                }
            }
        }
    }
}

/// Let the tail of an abandoned frame arrive, then discard it so the next
/// exchange starts on a frame boundary
fn drain(transport: &mut dyn Transport) {
    std::thread::sleep(DRAIN_DELAY);
    if let Err(e) = transport.clear() {
        debug!("failed to clear channel after cancellation: {}", e);
    }
}
