use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{McuError, Result};
use crate::frame::{McuCommand, McuHeader, McuQuery, McuResponse};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// One per live sequence number. Anything older can no longer be waited for.
pub const MAX_QUEUED_RESPONSES: usize = 15;

/// Transmit side of the channel, e.g. the MCU tx queue of a device.
pub trait McuTransport: Send {
    fn transmit(&mut self, frame: Vec<u8>) -> std::result::Result<(), String>;
}

struct TxState<T> {
    transport: T,
    /// Raw counter; the low four bits are the wire sequence number.
    seq: u8,
}

impl<T> TxState<T> {
    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq & 0xf == 0 {
            self.seq = self.seq.wrapping_add(1);
        }
        self.seq & 0xf
    }
}

/// Serialised request/response channel to the MCU.
pub struct McuChannel<T> {
    /// Held for the whole of a send, response wait included.
    tx: Mutex<TxState<T>>,
    responses: Mutex<VecDeque<McuResponse>>,
    response_ready: Condvar,
    timeout: Duration,
    hang: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T: McuTransport> McuChannel<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self {
            tx: Mutex::new(TxState { transport, seq: 0 }),
            responses: Mutex::new(VecDeque::new()),
            response_ready: Condvar::new(),
            timeout,
            hang: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set once a command times out, until [`McuChannel::clear_hang`].
    pub fn is_hung(&self) -> bool {
        self.hang.load(Ordering::Acquire)
    }

    /// Returns whether the flag was set.
    pub fn clear_hang(&self) -> bool {
        self.hang.swap(false, Ordering::AcqRel)
    }

    /// Run `f` against the transport. Waits for any in-flight command.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut lock(&self.tx).transport)
    }

    /// Hand a response from the receive side to the waiting sender.
    ///
    /// Responses nobody waits for, such as replies to commands sent without
    /// `expects_response`, are kept only up to [`MAX_QUEUED_RESPONSES`]; the oldest go first.
    pub fn deliver_response(&self, response: McuResponse) {
        let mut responses = lock(&self.responses);
        while responses.len() >= MAX_QUEUED_RESPONSES {
            if let Some(dropped) = responses.pop_front() {
                debug!(seq = dropped.seq, "dropping unclaimed mcu response");
            }
        }
        responses.push_back(response);
        drop(responses);
        self.response_ready.notify_all();
    }

    /// Responses delivered but not yet claimed by a sender.
    pub fn queued_responses(&self) -> usize {
        lock(&self.responses).len()
    }

    /// Decode a raw response frame and deliver it.
    pub fn deliver_frame(&self, buf: &[u8]) -> Result<()> {
        self.deliver_response(McuResponse::decode(buf)?);
        Ok(())
    }

    pub fn send(
        &self,
        command: McuCommand,
        payload: &[u8],
        expects_response: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.send_with_query(command, McuQuery::NotApplicable, payload, expects_response)
    }

    /// Send one command. With `expects_response`, blocks until a response carrying the same
    /// sequence number arrives and returns its payload. Responses for other sequence numbers are
    /// dropped.
    pub fn send_with_query(
        &self,
        command: McuCommand,
        query: McuQuery,
        payload: &[u8],
        expects_response: bool,
    ) -> Result<Option<Vec<u8>>> {
        let mut tx = lock(&self.tx);
        let seq = tx.next_seq();
        let frame = McuHeader::encode(command, query, seq, payload)?;
        tx.transport.transmit(frame).map_err(McuError::Transport)?;
        debug!(?command, seq, len = payload.len(), "mcu command sent");
        if !expects_response {
            return Ok(None);
        }

        let deadline = Instant::now() + self.timeout;
        let mut responses = lock(&self.responses);
        loop {
            while let Some(response) = responses.pop_front() {
                if response.seq == seq {
                    return Ok(Some(response.payload));
                }
                debug!(expected = seq, got = response.seq, "dropping stale mcu response");
            }

            let now = Instant::now();
            if now >= deadline {
                self.hang.store(true, Ordering::Release);
                warn!(?command, seq, "mcu command timed out");
                return Err(McuError::Timeout);
            }
            responses = match self.response_ready.wait_timeout(responses, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
