//! Command bytes waiting to ride out on the next playback frame
//!
//! Producers take the write lock, append whole commands and let go. The playback
//! completion callback takes the read lock once per frame, copies what is there
//! and resets the length before the lock is released, so no append can land
//! between the copy and the reset.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bytes that fit in one ancillary packet.
pub const COMMAND_CAPACITY: usize = 255;

struct Inner {
    data: [u8; COMMAND_CAPACITY],
    len: AtomicUsize,
}

/// Fixed-capacity command buffer shared between producers and the scheduler.
pub struct CommandBuffer {
    inner: RwLock<Inner>,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                data: [0; COMMAND_CAPACITY],
                len: AtomicUsize::new(0),
            }),
        }
    }

    /// Take exclusive access for appending. The lock goes away with the guard.
    pub fn acquire_write(&self) -> CommandWriteGuard<'_> {
        CommandWriteGuard {
            inner: self.inner.write(),
        }
    }

    /// Run `f` over the pending bytes and reset the buffer, all under the read lock.
    ///
    /// `f` sees an empty slice when nothing is pending.
    pub fn drain_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.read();
        let len = inner.len.load(Ordering::Acquire);
        let result = f(&inner.data[..len]);
        inner.len.store(0, Ordering::Release);
        if len > 0 {
            debug!("Drained {} command bytes", len);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.inner.read().len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        COMMAND_CAPACITY
    }
}

/// Exclusive access to a [`CommandBuffer`].
pub struct CommandWriteGuard<'a> {
    inner: RwLockWriteGuard<'a, Inner>,
}

impl CommandWriteGuard<'_> {
    /// Append one encoded command. Nothing is written if it does not fit.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let len = *self.inner.len.get_mut();
        let available = COMMAND_CAPACITY - len;
        if bytes.len() > available {
            warn!(
                "Command of {} bytes does not fit, {} bytes free",
                bytes.len(),
                available
            );
            return Err(Error::CommandOverflow {
                requested: bytes.len(),
                available,
            });
        }

        self.inner.data[len..len + bytes.len()].copy_from_slice(bytes);
        *self.inner.len.get_mut() = len + bytes.len();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        COMMAND_CAPACITY - self.len()
    }
}
