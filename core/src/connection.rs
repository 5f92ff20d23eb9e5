//! Process wide serialization of bluetooth links.
//!
//! The radio can only service one logical connection at a time, whichever
//! transport drives it, so every session goes through a single exclusivity
//! token. A [`ScopedSession`] disconnects and hands the token back when it is
//! dropped, including during unwinding.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::ble::Backend;
use crate::error::BackendError;
use crate::models::DeviceAddress;

static GLOBAL: ConnectionManager = ConnectionManager::new();

pub struct ConnectionManager {
    held: Mutex<bool>,
    released: Condvar,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub const fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// The manager shared by every poller in the process.
    pub fn global() -> &'static ConnectionManager {
        &GLOBAL
    }

    pub fn is_connected(&self) -> bool {
        *self.state()
    }

    /// Block until the token is free, then connect `backend` to `address`.
    pub fn acquire<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
        address: &DeviceAddress,
    ) -> Result<ScopedSession<'a>, BackendError> {
        let mut held = self.state();
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
        drop(held);
        self.open(backend, address)
    }

    /// Like [`acquire`](Self::acquire) but returns `Ok(None)` instead of
    /// waiting when another session is active.
    pub fn try_acquire<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
        address: &DeviceAddress,
    ) -> Result<Option<ScopedSession<'a>>, BackendError> {
        {
            let mut held = self.state();
            if *held {
                return Ok(None);
            }
            *held = true;
        }
        self.open(backend, address).map(Some)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `wait`.
    pub fn acquire_timeout<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
        address: &DeviceAddress,
        wait: Duration,
    ) -> Result<ScopedSession<'a>, BackendError> {
        let deadline = Instant::now() + wait;
        let mut held = self.state();
        while *held {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BackendError::timeout("waiting for the bluetooth link", 1));
            }
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *held = true;
        drop(held);
        self.open(backend, address)
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Caller has already marked the token as held.
    fn open<'a>(
        &'a self,
        backend: &'a mut dyn Backend,
        address: &DeviceAddress,
    ) -> Result<ScopedSession<'a>, BackendError> {
        let token = Token { manager: self };
        debug!(%address, backend = %backend.kind(), "connecting");
        // On failure `token` is dropped here and the lock is free again
        // before the error reaches the caller.
        backend.connect(address)?;
        Ok(ScopedSession {
            backend,
            token: Some(token),
        })
    }

    fn release(&self) {
        *self.state() = false;
        self.released.notify_one();
        trace!("bluetooth token released");
    }
}

struct Token<'a> {
    manager: &'a ConnectionManager,
}

impl Drop for Token<'_> {
    fn drop(&mut self) {
        self.manager.release();
    }
}

/// An open connection holding the process wide token.
pub struct ScopedSession<'a> {
    backend: &'a mut dyn Backend,
    token: Option<Token<'a>>,
}

impl ScopedSession<'_> {
    /// Disconnect and release the token now instead of at end of scope.
    pub fn release(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(token) = self.token.take() {
            self.backend.disconnect();
            drop(token);
        }
    }
}

impl<'a> Deref for ScopedSession<'a> {
    type Target = dyn Backend + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.backend
    }
}

impl DerefMut for ScopedSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.backend
    }
}

impl Drop for ScopedSession<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
