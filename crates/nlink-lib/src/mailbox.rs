//! Single-slot shared reply frame between the primary pump and one engine.
//!
//! Frame layout (capacity `C` fixed at construction):
//!
//! ```text
//! offset 0..4   u32 payload length, little-endian; 0 = empty / pending
//! offset 4..C   encoded TransferReply
//! ```
//!
//! The length word doubles as the ready flag. The pump copies the payload in,
//! publishes the length with release ordering and notifies. The engine side
//! blocks until the length is non-zero, copies the payload out and resets the
//! length to 0, leaving the slot empty for the next request.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::protocol::MAILBOX_HEADER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The encoded reply does not fit in the payload region.
    Overflow { len: usize, capacity: usize },
    /// The requested capacity cannot hold the header plus one payload byte.
    CapacityTooSmall(usize),
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxError::Overflow { len, capacity } => write!(
                f,
                "reply of {len} bytes overflows mailbox of {capacity} bytes"
            ),
            MailboxError::CapacityTooSmall(c) => {
                write!(f, "mailbox capacity {c} cannot hold a reply")
            }
        }
    }
}

impl std::error::Error for MailboxError {}

pub type Result<T> = std::result::Result<T, MailboxError>;

pub struct Mailbox {
    capacity: usize,
    len: AtomicU32,
    payload: Mutex<Box<[u8]>>,
    wake: (Mutex<()>, Condvar),
}

impl Mailbox {
    /// Allocate a frame of `capacity` bytes, header included.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity <= MAILBOX_HEADER_SIZE || capacity - MAILBOX_HEADER_SIZE > u32::MAX as usize {
            return Err(MailboxError::CapacityTooSmall(capacity));
        }
        Ok(Self {
            capacity,
            len: AtomicU32::new(0),
            payload: Mutex::new(vec![0u8; capacity - MAILBOX_HEADER_SIZE].into_boxed_slice()),
            wake: (Mutex::new(()), Condvar::new()),
        })
    }

    /// Total frame size in bytes, header included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest reply the frame can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity - MAILBOX_HEADER_SIZE
    }

    /// Current value of the length word. 0 means no reply is waiting.
    pub fn pending_len(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }

    /// Publish an encoded reply and wake the waiting reader.
    ///
    /// An oversized reply is rejected before anything is touched: the length
    /// word stays 0 and no waiter is woken.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.max_payload() {
            return Err(MailboxError::Overflow {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        {
            let mut payload = self.payload.lock().unwrap_or_else(PoisonError::into_inner);
            payload[..bytes.len()].copy_from_slice(bytes);
        }
        // max_payload() fits in u32, checked in new()
        self.len.store(bytes.len() as u32, Ordering::Release);

        let (lock, cvar) = &self.wake;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        cvar.notify_all();
        Ok(())
    }

    /// Block until a reply is published, then take it and empty the slot.
    ///
    /// There is no timeout: if the writer never publishes, this never returns.
    pub fn wait(&self) -> Vec<u8> {
        let (lock, cvar) = &self.wake;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.len.load(Ordering::Acquire) == 0 {
            guard = cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
        drop(guard);
        self.take_ready()
    }

    /// Take the reply if one is waiting, without blocking.
    pub fn try_take(&self) -> Option<Vec<u8>> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.take_ready())
    }

    fn take_ready(&self) -> Vec<u8> {
        let len = self.len.load(Ordering::Acquire) as usize;
        let out = {
            let payload = self.payload.lock().unwrap_or_else(PoisonError::into_inner);
            payload[..len].to_vec()
        };
        self.len.store(0, Ordering::Release);
        out
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("capacity", &self.capacity)
            .field("pending_len", &self.pending_len())
            .finish()
    }
}
