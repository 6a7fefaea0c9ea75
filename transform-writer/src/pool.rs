//! Lazily established, explicitly released sink connections.
//!
//! Every sink owns exactly one [`LazyConnection`]. The connection is not opened when the sink is
//! configured but on the first write, and it stays open (and is reused) until the sink is released.
//! A released connection can be opened again by the next write.
//!
//! ```no_rust
//!   Uninitialized --get_handle--> Connected --release--> Released
//!                                    ^                      |
//!                                    +------get_handle------+
//! ```
//!
//! [`Pool`] is a small bounded pool used by sinks whose driver does not come with its own.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::Result;
use crate::error::Error;
use crate::retry::RetryPolicy;

pub const DEFAULT_POOL_MIN_SIZE: usize = 1;
pub const DEFAULT_POOL_MAX_SIZE: usize = 3;

/// Opens and closes the handle a sink writes through.
#[trait_variant::make(Connector: Send)]
pub trait LocalConnector {
    type Handle: Send;

    /// Establish a new handle, e.g. create the connection pool.
    async fn connect(&self) -> Result<Self::Handle>;

    /// Give the handle's resources back and wait for the teardown to finish.
    async fn close(&self, handle: Self::Handle);
}

/// Lifecycle of a [`LazyConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    Released,
}

enum HandleState<H> {
    Uninitialized,
    Connected(H),
    Released,
}

/// Owns at most one handle created by `C`.
pub struct LazyConnection<C: Connector> {
    connector: C,
    state: HandleState<C::Handle>,
    connects: usize,
}

impl<C: Connector> LazyConnection<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            state: HandleState::Uninitialized,
            connects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            HandleState::Uninitialized => ConnectionState::Uninitialized,
            HandleState::Connected(_) => ConnectionState::Connected,
            HandleState::Released => ConnectionState::Released,
        }
    }

    /// Number of handles created so far.
    pub fn connects(&self) -> usize {
        self.connects
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the live handle, connecting first if there is none.
    pub async fn get_handle(&mut self) -> Result<&mut C::Handle> {
        if !matches!(self.state, HandleState::Connected(_)) {
            let handle = self.connector.connect().await?;
            self.connects += 1;
            self.state = HandleState::Connected(handle);
        }
        self.handle()
    }

    /// Like [`LazyConnection::get_handle`], retrying a transient connect failure per `policy`.
    pub async fn get_handle_with_retry(&mut self, policy: &RetryPolicy) -> Result<&mut C::Handle> {
        if !matches!(self.state, HandleState::Connected(_)) {
            let connector = &self.connector;
            let handle = policy.attempt(|| connector.connect()).await?;
            self.connects += 1;
            self.state = HandleState::Connected(handle);
        }
        self.handle()
    }

    fn handle(&mut self) -> Result<&mut C::Handle> {
        match &mut self.state {
            HandleState::Connected(handle) => Ok(handle),
            HandleState::Uninitialized | HandleState::Released => Err(Error::Connection(
                "connection handle is not established".to_string(),
            )),
        }
    }

    /// Closes the handle, if any. Safe to call more than once.
    pub async fn release(&mut self) {
        match std::mem::replace(&mut self.state, HandleState::Released) {
            HandleState::Connected(handle) => self.connector.close(handle).await,
            HandleState::Uninitialized => self.state = HandleState::Uninitialized,
            HandleState::Released => {}
        }
    }
}

/// Min and max number of connections a pool holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    pub min: usize,
    pub max: usize,
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self {
            min: DEFAULT_POOL_MIN_SIZE,
            max: DEFAULT_POOL_MAX_SIZE,
        }
    }
}

impl PoolBounds {
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if max == 0 || min > max {
            return Err(Error::Config(format!(
                "invalid pool bounds min={min} max={max}"
            )));
        }
        Ok(Self { min, max })
    }
}

/// Opens single connections for a [`Pool`]. The pool is shared across tasks, so factories are
/// expected to be `Sync`; only `Send` is required of the future `open` returns.
#[trait_variant::make(ConnectionFactory: Send)]
pub trait LocalConnectionFactory {
    type Connection: Send;

    async fn open(&self) -> Result<Self::Connection>;
}

/// A bounded pool. At most `max` connections are checked out at the same time; a caller asking
/// for one more waits until another is returned. `min` connections are opened up front.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    bounds: PoolBounds,
    idle: Mutex<Vec<F::Connection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    /// Signalled whenever a connection comes back to a closed pool.
    returned: Notify,
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("bounds", &self.bounds)
            .field("idle", &self.idle.lock().len())
            .field("available", &self.permits.available_permits())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    pub async fn connect(factory: F, bounds: PoolBounds) -> Result<Arc<Self>> {
        let mut idle = Vec::with_capacity(bounds.max);
        for _ in 0..bounds.min {
            idle.push(factory.open().await?);
        }
        info!(min = bounds.min, max = bounds.max, "Connection pool created");
        Ok(Arc::new(Self {
            factory,
            bounds,
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(bounds.max)),
            closed: AtomicBool::new(false),
            returned: Notify::new(),
        }))
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Checks out a connection, reusing an idle one when possible.
    pub async fn get(self: &Arc<Self>) -> Result<Pooled<F>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Connection("connection pool is closed".to_string()))?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!("Opening a new pooled connection");
                self.factory.open().await?
            }
        };

        Ok(Pooled {
            conn: Some(conn),
            pool: Arc::clone(self),
            discard: false,
            permit: Some(permit),
        })
    }

    /// Stops handing out connections and drops the idle ones. Connections still checked out are
    /// dropped when they come back.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().clear();
    }

    /// Waits until every checked out connection came back to a closed pool.
    pub async fn wait_closed(&self) {
        loop {
            let mut returned = pin!(self.returned.notified());
            // register before checking so a return in between is not missed
            returned.as_mut().enable();
            // once all permits are back, nothing is checked out anymore
            if self.permits.available_permits() >= self.bounds.max {
                return;
            }
            returned.await;
        }
    }

    fn put_back(&self, conn: F::Connection) {
        if self.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.bounds.max {
            idle.push(conn);
        }
    }
}

/// A checked out connection, returned to its pool on drop.
pub struct Pooled<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<Pool<F>>,
    discard: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl<F: ConnectionFactory> Pooled<F> {
    /// Marks the connection as broken so it is dropped instead of returned.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<F: ConnectionFactory> Deref for Pooled<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // only taken in Drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && !self.discard
        {
            self.pool.put_back(conn);
        }
        // the permit goes back before waiters look at the available permits
        drop(self.permit.take());
        if self.pool.is_closed() {
            self.pool.returned.notify_waiters();
        }
    }
}
