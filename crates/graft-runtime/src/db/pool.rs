//! Bounded connection pool.
//!
//! All pool state lives behind one mutex that is never held across an await.
//! A returned connection goes straight to the longest waiting caller when
//! there is one, otherwise back to the idle list. A slot freed by a dead or
//! failed connection is likewise handed to the longest waiting caller, which
//! opens its own connection without queueing again. A background task evicts
//! idle connections past their timeout without dropping below `min_size`.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use graft_core::config::PoolConfig;
use graft_core::error::{PoolError, Result};
use graft_core::store::Connection;

type ConnectionFactory<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// What a waiting caller receives.
enum Handoff<C> {
    Connection(C),
    /// A slot was freed and is now held for the waiter.
    Slot,
}

struct Waiter<C> {
    id: u64,
    sender: oneshot::Sender<Handoff<C>>,
}

struct IdleConnection<C> {
    conn: C,
    last_used: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    /// Idle plus checked out plus slots reserved for connections being created.
    total: usize,
    waiters: VecDeque<Waiter<C>>,
    next_waiter_id: u64,
    closed: bool,
}

struct PoolInner<C: Connection> {
    config: PoolConfig,
    factory: ConnectionFactory<C>,
    state: Mutex<PoolState<C>>,
    shutdown: CancellationToken,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
    pub waiting: usize,
}

/// A bounded pool of store connections.
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> Pool<C> {
    /// Create a pool and open `min_size` connections up front. If any of
    /// them fails, the ones already opened are closed and the error returned.
    pub async fn new<F, Fut>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        config.validate()?;
        let factory: ConnectionFactory<C> = Arc::new(move || factory().boxed());

        let mut idle = VecDeque::with_capacity(config.min_size);
        for _ in 0..config.min_size {
            match factory().await {
                Ok(conn) => idle.push_back(IdleConnection {
                    conn,
                    last_used: Instant::now(),
                }),
                Err(e) => {
                    warn!(error = %e, opened = idle.len(), "Failed to pre-warm connection pool");
                    for warm in idle {
                        warm.conn.close();
                    }
                    return Err(e);
                }
            }
        }

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                total: idle.len(),
                idle,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                closed: false,
            }),
            config,
            factory,
            shutdown: CancellationToken::new(),
        });

        if let Some(idle_timeout) = inner.config.idle_timeout {
            spawn_evictor(&inner, idle_timeout);
        }

        info!(
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "Connection pool ready"
        );
        Ok(Self { inner })
    }

    /// Check out a connection.
    ///
    /// Blocks while the pool is at capacity until a connection is returned,
    /// the wait timeout elapses, `cancel` fires or the pool is closed.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<PooledConnection<C>> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled.into());
        }

        let (step, dead) = self.inner.next_step()?;
        for conn in dead {
            debug!("Discarding dead idle connection");
            conn.close();
        }

        let mut ticket = match step {
            Step::Ready(conn) => return Ok(self.guard(conn)),
            Step::Create(reservation) => return self.open(cancel, reservation).await,
            Step::Wait(ticket) => ticket,
        };

        let wait_timeout = self.inner.config.wait_timeout;
        let handoff = tokio::select! {
            handoff = &mut ticket.receiver => handoff,
            _ = cancel.cancelled() => return Err(PoolError::Cancelled.into()),
            _ = wait_until(wait_timeout) => {
                return Err(PoolError::Timeout(wait_timeout.unwrap_or_default()).into());
            }
        };
        ticket.settle();

        match handoff {
            Ok(Handoff::Connection(conn)) if conn.is_open() => Ok(self.guard(conn)),
            Ok(Handoff::Connection(conn)) => {
                debug!("Replacing dead connection received from handoff");
                conn.close();
                self.open(cancel, self.inner.held_slot()).await
            }
            Ok(Handoff::Slot) => self.open(cancel, self.inner.held_slot()).await,
            Err(_) => Err(PoolError::Closed.into()),
        }
    }

    /// Open a connection into a reserved slot. A connection that is already
    /// open when `cancel` fires goes to the pool instead of being dropped.
    async fn open(
        &self,
        cancel: &CancellationToken,
        reservation: SlotReservation<'_, C>,
    ) -> Result<PooledConnection<C>> {
        if self.inner.state().closed {
            return Err(PoolError::Closed.into());
        }

        let result = tokio::select! {
            biased;
            result = (self.inner.factory)() => result,
            _ = cancel.cancelled() => return Err(PoolError::Cancelled.into()),
        };
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to open connection");
                return Err(e);
            }
        };
        reservation.fulfil();
        debug!("Opened new connection");

        if cancel.is_cancelled() {
            self.inner.put(conn);
            return Err(PoolError::Cancelled.into());
        }
        Ok(self.guard(conn))
    }

    /// Close the pool. Idle connections are closed now, checked out ones when
    /// they come back, and every waiter fails with [`PoolError::Closed`].
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            available: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            total: state.total,
            waiting: state.waiters.len(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn guard(&self, conn: C) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }
}

enum Step<'a, C: Connection> {
    Ready(C),
    Create(SlotReservation<'a, C>),
    Wait(WaitTicket<'a, C>),
}

impl<C: Connection> PoolInner<C> {
    fn state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide how the next acquisition attempt proceeds. Dead idle
    /// connections found on the way are returned for closing outside the lock.
    fn next_step(&self) -> Result<(Step<'_, C>, Vec<C>)> {
        let mut state = self.state();
        if state.closed {
            return Err(PoolError::Closed.into());
        }

        let mut dead = Vec::new();
        while let Some(idle) = state.idle.pop_back() {
            if idle.conn.is_open() {
                return Ok((Step::Ready(idle.conn), dead));
            }
            state.total -= 1;
            dead.push(idle.conn);
        }

        if state.total < self.config.max_size {
            state.total += 1;
            return Ok((Step::Create(self.held_slot()), dead));
        }

        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let (sender, receiver) = oneshot::channel();
        state.waiters.push_back(Waiter { id, sender });
        let ticket = WaitTicket {
            id,
            receiver,
            inner: self,
            settled: false,
        };
        Ok((Step::Wait(ticket), dead))
    }

    fn put(&self, conn: C) {
        let mut state = self.state();
        if state.closed || !conn.is_open() {
            Self::pass_slot(&mut state);
            drop(state);
            conn.close();
            return;
        }

        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.sender.send(Handoff::Connection(conn)) {
                Ok(()) => return,
                Err(Handoff::Connection(returned)) => conn = returned,
                Err(Handoff::Slot) => return,
            }
        }
        state.idle.push_back(IdleConnection {
            conn,
            last_used: Instant::now(),
        });
    }

    /// A slot already counted in `total` that the caller now owns.
    fn held_slot(&self) -> SlotReservation<'_, C> {
        SlotReservation {
            inner: self,
            armed: true,
        }
    }

    fn release_slot(&self) {
        Self::pass_slot(&mut self.state());
    }

    /// Give a slot to the longest waiting caller, or free it when nobody waits.
    fn pass_slot(state: &mut PoolState<C>) {
        if !state.closed {
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.sender.send(Handoff::Slot).is_ok() {
                    return;
                }
            }
        }
        state.total = state.total.saturating_sub(1);
    }

    /// A waiter gave up. If the pool already handed it something, pass that on.
    fn abandon_wait(&self, id: u64, receiver: &mut oneshot::Receiver<Handoff<C>>) {
        let mut state = self.state();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
            return;
        }

        // Handoffs happen under the lock, so anything sent is visible now.
        match receiver.try_recv() {
            Ok(Handoff::Connection(conn)) => {
                drop(state);
                self.put(conn);
            }
            Ok(Handoff::Slot) => Self::pass_slot(&mut state),
            Err(_) => {}
        }
    }

    fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut state = self.state();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(idle) = state.idle.pop_front() {
                let expired = now.duration_since(idle.last_used) >= idle_timeout;
                if expired && state.total > self.config.min_size {
                    state.total -= 1;
                    evicted.push(idle.conn);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
        }

        for conn in &evicted {
            conn.close();
        }
        evicted.len()
    }

    fn close(&self) {
        let idle: Vec<IdleConnection<C>> = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the senders fails every waiter.
            state.waiters.clear();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };

        self.shutdown.cancel();
        for entry in &idle {
            entry.conn.close();
        }
        info!(closed = idle.len(), "Connection pool closed");
    }
}

impl<C: Connection> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_evictor<C: Connection>(inner: &Arc<PoolInner<C>>, idle_timeout: Duration) {
    let pool: Weak<PoolInner<C>> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let period = (idle_timeout / 2).max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else { break };
                    let evicted = inner.evict_idle(idle_timeout);
                    if evicted > 0 {
                        debug!(evicted, "Evicted idle connections");
                    }
                }
            }
        }
    });
}

async fn wait_until(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

/// A slot counted in `total` for a connection that is still being opened.
/// Released again unless the connection arrives.
struct SlotReservation<'a, C: Connection> {
    inner: &'a PoolInner<C>,
    armed: bool,
}

impl<C: Connection> SlotReservation<'_, C> {
    fn fulfil(mut self) {
        self.armed = false;
    }
}

impl<C: Connection> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_slot();
        }
    }
}

/// A queued acquisition. Dropping it before it is settled removes the waiter.
struct WaitTicket<'a, C: Connection> {
    id: u64,
    receiver: oneshot::Receiver<Handoff<C>>,
    inner: &'a PoolInner<C>,
    settled: bool,
}

impl<C: Connection> WaitTicket<'_, C> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<C: Connection> Drop for WaitTicket<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.abandon_wait(self.id, &mut self.receiver);
        }
    }
}

/// A checked out connection. Goes back to the pool when dropped.
pub struct PooledConnection<C: Connection> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Return the connection to the pool.
    pub fn release(self) {}
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
            .as_ref()
            .expect("pooled connection is present until dropped")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}
