//! Connection pool primitives for the metadata store and engine drivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct PoolState<T> {
    idle: Vec<T>,
}

type Factory<T> = Box<dyn Fn() -> Result<T, String> + Send + Sync>;

/// A bounded pool for reusable connection-like objects.
pub struct Pool<T> {
    max: usize,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("failed to open pooled connection: {0}")]
    Create(String),
}

/// A pooled value that returns to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
}

impl<T> Pool<T> {
    pub fn new<F, E>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        Arc::new(Self {
            max: max.max(1),
            factory: Box::new(move || factory().map_err(|err| err.to_string())),
            state: Mutex::new(PoolState { idle: Vec::new() }),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        // The idle list stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Pooled<T>, AcquireError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut state = self.lock_state();
        loop {
            if let Some(item) = state.idle.pop() {
                return Ok(Pooled {
                    pool: Arc::clone(self),
                    value: Some(item),
                });
            }

            if self.in_flight.load(Ordering::SeqCst) < self.max {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                drop(state);
                return match (self.factory)() {
                    Ok(item) => Ok(Pooled {
                        pool: Arc::clone(self),
                        value: Some(item),
                    }),
                    Err(err) => {
                        self.discard();
                        Err(AcquireError::Create(err))
                    }
                };
            }

            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(AcquireError::Timeout);
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(state, limit - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard
                }
            };
        }
    }

    fn release(&self, item: T) {
        let mut state = self.lock_state();
        state.idle.push(item);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    /// Drops the value instead of returning it, freeing a slot for a fresh one.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `discard` and `drop` take the value, and both consume the guard.
        match self.value.as_ref() {
            Some(value) => value,
            None => unreachable!("pooled value taken before drop"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}
