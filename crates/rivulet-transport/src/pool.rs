//! # Object Pools
//!
//! Fixed-capacity pools for hot-path objects (packet buffers, NAK records).
//! Objects are allocated lazily up to `capacity` and recycled on drop of the
//! [`Pooled`] guard, so steady-state operation does no heap churn.
//!
//! Each pool tracks a high and a low watermark on the number of objects in
//! use. Crossing the high watermark raises one alert; falling back to the low
//! watermark clears it with one alert. Alerts are delivered through a callback
//! invoked outside the pool lock.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reset an object before it goes back into its pool.
pub trait Recycle {
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// Watermark transition reported by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkAlert {
    High { pool: &'static str, in_use: usize },
    Low { pool: &'static str, in_use: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub capacity: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl PoolConfig {
    /// Watermarks at 90% / 70% of capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        PoolConfig {
            capacity,
            high_watermark: capacity * 9 / 10,
            low_watermark: capacity * 7 / 10,
        }
    }
}

type AlertFn = Box<dyn Fn(WatermarkAlert) + Send + Sync>;
type FactoryFn<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolState<T> {
    free: Vec<T>,
    in_use: usize,
    high: bool,
    closed: bool,
}

struct Shared<T> {
    name: &'static str,
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    factory: FactoryFn<T>,
    alert: Mutex<Option<AlertFn>>,
}

impl<T: Recycle> Shared<T> {
    /// Take one object with the state lock held. Returns the object and any
    /// watermark alert to deliver after unlocking.
    fn take_locked(&self, state: &mut PoolState<T>) -> Option<(T, Option<WatermarkAlert>)> {
        if state.closed || state.in_use >= self.config.capacity {
            return None;
        }
        let value = state.free.pop().unwrap_or_else(|| (self.factory)());
        state.in_use += 1;
        let alert = if !state.high && state.in_use >= self.config.high_watermark {
            state.high = true;
            Some(WatermarkAlert::High {
                pool: self.name,
                in_use: state.in_use,
            })
        } else {
            None
        };
        Some((value, alert))
    }

    fn release(&self, mut value: T) {
        value.recycle();
        let alert = {
            let mut state = self.state.lock();
            state.in_use -= 1;
            state.free.push(value);
            if state.high && state.in_use <= self.config.low_watermark {
                state.high = false;
                Some(WatermarkAlert::Low {
                    pool: self.name,
                    in_use: state.in_use,
                })
            } else {
                None
            }
        };
        self.available.notify_one();
        if let Some(alert) = alert {
            self.raise(alert);
        }
    }

    fn raise(&self, alert: WatermarkAlert) {
        if let Some(f) = self.alert.lock().as_ref() {
            f(alert);
        }
    }
}

/// Shared handle to a fixed-capacity object pool.
pub struct Pool<T: Recycle> {
    shared: Arc<Shared<T>>,
}

impl<T: Recycle> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Recycle> Pool<T> {
    pub fn new(
        name: &'static str,
        config: PoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        Pool {
            shared: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    in_use: 0,
                    high: false,
                    closed: false,
                }),
                available: Condvar::new(),
                factory: Box::new(factory),
                alert: Mutex::new(None),
            }),
        }
    }

    /// Install the watermark alert callback, replacing any previous one.
    pub fn set_alert(&self, f: impl Fn(WatermarkAlert) + Send + Sync + 'static) {
        *self.shared.alert.lock() = Some(Box::new(f));
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    pub fn in_use(&self) -> usize {
        self.shared.state.lock().in_use
    }

    /// Non-blocking acquire. `None` when exhausted or closed.
    pub fn try_acquire(&self) -> Option<Pooled<T>> {
        let taken = {
            let mut state = self.shared.state.lock();
            self.shared.take_locked(&mut state)
        };
        taken.map(|(value, alert)| self.wrap(value, alert))
    }

    /// Blocking acquire. Waits up to `timeout` for an object to be returned.
    /// `None` on timeout or once the pool is closed.
    pub fn acquire(&self, timeout: Duration) -> Option<Pooled<T>> {
        let deadline = Instant::now() + timeout;
        let taken = {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(taken) = self.shared.take_locked(&mut state) {
                    break Some(taken);
                }
                if state.closed {
                    break None;
                }
                if self
                    .shared
                    .available
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break self.shared.take_locked(&mut state);
                }
            }
        };
        taken.map(|(value, alert)| self.wrap(value, alert))
    }

    /// Refuse further acquires and wake every blocked acquirer. Objects still
    /// in use return normally.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
    }

    fn wrap(&self, value: T, alert: Option<WatermarkAlert>) -> Pooled<T> {
        if let Some(alert) = alert {
            self.shared.raise(alert);
        }
        Pooled {
            value: Some(value),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Recycle> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.config.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// An object on loan from a [`Pool`]; returned when dropped.
pub struct Pooled<T: Recycle> {
    value: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` empties the option.
        match &self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.shared.release(value);
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&**self).finish()
    }
}
