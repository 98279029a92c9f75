use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{Manager, PoolConfig, PoolError};

/// A bounded pool of long-lived resources (e.g. broker connections).
///
/// # Fairness
///
/// Callers waiting in [`ResourcePool::get`] are served first-in-first-out.
/// Released resources are handed out most-recently-used first, so that rarely needed
/// resources age in the idle set and get evicted.
///
/// # Idle eviction
///
/// A background task runs every [`PoolConfig::eviction_interval`]: it destroys the resources
/// that have been idle for at least [`PoolConfig::idle_timeout`] without going below
/// [`PoolConfig::min`] live resources, then tops the pool back up to `min`.
///
/// The pool does not validate a resource before handing it out. Resources reported as broken
/// by [`Manager::is_broken`] are destroyed when they are released.
pub struct ResourcePool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

/// A snapshot of the state of a [`ResourcePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Live resources, idle or checked out.
    pub size: usize,
    pub idle: usize,
    /// Resources checked out, being created or being destroyed after release.
    pub in_use: usize,
}

struct PoolInner<M: Manager> {
    manager: M,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    slots: Mutex<Slots<M::Type>>,
    in_use: watch::Sender<usize>,
    stop_eviction: watch::Sender<bool>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: watch::Sender<bool>,
}

struct Slots<T> {
    /// Oldest release first.
    idle: VecDeque<Idle<T>>,
    size: usize,
    closing: bool,
}

struct Idle<T> {
    obj: T,
    since: Instant,
}

/// A builder for [`ResourcePool`].
///
/// Use [`ResourcePool::builder`] as entrypoint.
pub struct PoolBuilder<M: Manager> {
    manager: M,
    config: PoolConfig,
}

impl<M: Manager> PoolBuilder<M> {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Maximum number of live resources. Defaults to 10.
    #[must_use]
    pub fn max_size(mut self, max: usize) -> Self {
        self.config.max = max;
        self
    }

    /// Number of live resources idle eviction keeps around. Defaults to 0.
    #[must_use]
    pub fn min_size(mut self, min: usize) -> Self {
        self.config.min = min;
        self
    }

    /// Defaults to 5 seconds.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// Defaults to 15 seconds. `Duration::ZERO` disables idle eviction.
    #[must_use]
    pub fn eviction_interval(mut self, eviction_interval: Duration) -> Self {
        self.config.eviction_interval = eviction_interval;
        self
    }

    /// Finalise the builder.
    ///
    /// Idle eviction only runs if `build` is called from within a tokio runtime.
    pub fn build(self) -> Result<ResourcePool<M>, PoolError> {
        self.config.validate()?;
        let Self { manager, config } = self;

        let inner = Arc::new(PoolInner {
            manager,
            config,
            semaphore: Arc::new(Semaphore::new(config.max)),
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(config.max),
                size: 0,
                closing: false,
            }),
            in_use: watch::channel(0).0,
            stop_eviction: watch::channel(false).0,
            eviction_task: Mutex::new(None),
            shut_down: watch::channel(false).0,
        });

        if !config.eviction_interval.is_zero() {
            match Handle::try_current() {
                Ok(runtime) => {
                    let task = run_eviction(
                        Arc::downgrade(&inner),
                        inner.stop_eviction.subscribe(),
                        config.eviction_interval,
                    );
                    *lock(&inner.eviction_task) = Some(runtime.spawn(task));
                }
                Err(_) => warn!("No tokio runtime available, idle resources will not be evicted"),
            }
        }

        Ok(ResourcePool { inner })
    }
}

impl<M: Manager> ResourcePool<M> {
    /// Start building a [`ResourcePool`] around `manager`.
    pub fn builder(manager: M) -> PoolBuilder<M> {
        PoolBuilder {
            manager,
            config: PoolConfig::default(),
        }
    }

    /// Get a resource from the pool.
    ///
    /// It reuses an idle resource if there is one, or creates a new one if the pool has room
    /// for it. Otherwise it waits until another caller releases (or discards) a resource.
    pub async fn get(&self) -> Result<Object<M>, PoolError> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let reused = {
            let mut slots = self.inner.slots();
            if slots.closing {
                return Err(PoolError::Closed);
            }
            self.inner.in_use.send_modify(|n| *n += 1);
            slots.idle.pop_back()
        };
        let mut checkout = CheckoutGuard {
            pool: &self.inner,
            armed: true,
        };

        let obj = match reused {
            Some(idle) => {
                debug!("Reusing an idle pooled resource");
                idle.obj
            }
            None => {
                let obj = self
                    .inner
                    .manager
                    .create()
                    .await
                    .map_err(PoolError::Backend)?;
                let size = {
                    let mut slots = self.inner.slots();
                    slots.size += 1;
                    slots.size
                };
                debug!(size, "Created a new pooled resource");
                obj
            }
        };
        checkout.armed = false;

        Ok(Object {
            obj: Some(obj),
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
        })
    }

    /// Give a resource back to the pool.
    ///
    /// Equivalent to dropping the [`Object`], except that a broken resource is destroyed
    /// before `release` returns.
    pub async fn release(&self, obj: Object<M>) {
        Object::release(obj).await
    }

    /// Shut the pool down.
    ///
    /// Pending and future calls to [`ResourcePool::get`] fail with [`PoolError::Closed`].
    /// `shutdown` waits for every checked out resource to be released, then destroys all
    /// resources. Calling it again waits for the first shutdown to complete.
    #[tracing::instrument(name = "pool_shutdown", skip_all)]
    pub async fn shutdown(&self) {
        let mut shut_down = self.inner.shut_down.subscribe();
        let already_closing = std::mem::replace(&mut self.inner.slots().closing, true);
        if already_closing {
            while !*shut_down.borrow_and_update() {
                if shut_down.changed().await.is_err() {
                    return;
                }
            }
            return;
        }

        self.inner.semaphore.close();
        self.inner.stop_eviction.send_replace(true);
        let eviction_task = lock(&self.inner.eviction_task).take();
        if let Some(task) = eviction_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Idle eviction task did not complete cleanly");
            }
        }

        let mut in_use = self.inner.in_use.subscribe();
        while *in_use.borrow_and_update() > 0 {
            if in_use.changed().await.is_err() {
                break;
            }
        }

        let idle = std::mem::take(&mut self.inner.slots().idle);
        for resource in idle {
            self.inner.destroy(resource.obj).await;
        }
        self.inner.shut_down.send_replace(true);
        debug!("Pool shut down");
    }

    /// Whether [`ResourcePool::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.slots().closing
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.inner.slots();
        PoolStatus {
            max_size: self.inner.config.max,
            size: slots.size,
            idle: slots.idle.len(),
            in_use: *self.inner.in_use.borrow(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }
}

impl<M: Manager> PoolInner<M> {
    fn slots(&self) -> MutexGuard<'_, Slots<M::Type>> {
        lock(&self.slots)
    }

    fn checked_in(&self) {
        self.in_use.send_modify(|n| *n -= 1);
    }

    /// Put a released resource back in the idle set, or dispose of it if it is broken.
    ///
    /// The permit is held until the resource is either idle or destroyed.
    fn return_object(self: &Arc<Self>, obj: M::Type, permit: Option<OwnedSemaphorePermit>) {
        if !self.manager.is_broken(&obj) {
            self.slots().idle.push_back(Idle {
                obj,
                since: Instant::now(),
            });
            self.checked_in();
            drop(permit);
            return;
        }

        self.destroy_detached(obj, permit);
    }

    /// Destroy a checked out resource on its own task, so that cancelling the caller cannot
    /// leak it. The permit and the checkout are given back once the resource is gone.
    fn destroy_detached(
        self: &Arc<Self>,
        obj: M::Type,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Option<JoinHandle<()>> {
        match Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(self);
                Some(runtime.spawn(async move {
                    pool.destroy(obj).await;
                    pool.checked_in();
                    drop(permit);
                }))
            }
            Err(_) => {
                warn!("No tokio runtime available, dropping a resource without destroying it");
                drop(obj);
                self.slots().size -= 1;
                self.checked_in();
                drop(permit);
                None
            }
        }
    }

    async fn destroy(&self, obj: M::Type) {
        if let Err(e) = self.manager.destroy(obj).await {
            error!(error = ?e, "Failed to destroy a pooled resource");
        }
        let size = {
            let mut slots = self.slots();
            slots.size -= 1;
            slots.size
        };
        debug!(size, "Destroyed a pooled resource");
    }

    /// Destroy resources idle for longer than `idle_timeout`, keeping at least `min` alive.
    ///
    /// Each evicted resource holds a permit until it is destroyed, so that `get` cannot
    /// create its replacement while it is still alive.
    async fn evict_idle(&self) {
        let expired = {
            let mut slots = self.slots();
            if slots.closing {
                return;
            }
            let now = Instant::now();
            let mut evictable = slots.size.saturating_sub(self.config.min);
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(slots.idle.len());
            for idle in std::mem::take(&mut slots.idle) {
                let permit = if evictable > 0
                    && now.duration_since(idle.since) >= self.config.idle_timeout
                {
                    Arc::clone(&self.semaphore).try_acquire_owned().ok()
                } else {
                    None
                };
                match permit {
                    Some(permit) => {
                        evictable -= 1;
                        expired.push((idle.obj, permit));
                    }
                    None => kept.push_back(idle),
                }
            }
            slots.idle = kept;
            expired
        };

        if !expired.is_empty() {
            debug!(n_evicted = expired.len(), "Evicting idle resources");
        }
        for (obj, permit) in expired {
            self.destroy(obj).await;
            drop(permit);
        }
    }

    /// Create idle resources until the pool holds `min` of them.
    async fn ensure_minimum(&self) {
        loop {
            let permit = {
                let slots = self.slots();
                if slots.closing || slots.size >= self.config.min {
                    return;
                }
                match Arc::clone(&self.semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => return,
                }
            };
            self.in_use.send_modify(|n| *n += 1);

            match self.manager.create().await {
                Ok(obj) => {
                    let mut slots = self.slots();
                    slots.size += 1;
                    slots.idle.push_back(Idle {
                        obj,
                        since: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(error = ?e, "Failed to create a resource to honour the pool minimum");
                    self.checked_in();
                    return;
                }
            }
            self.checked_in();
            drop(permit);
        }
    }
}

async fn run_eviction<M: Manager>(
    pool: Weak<PoolInner<M>>,
    mut stop: watch::Receiver<bool>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        let Some(pool) = pool.upgrade() else { break };
        pool.evict_idle().await;
        pool.ensure_minimum().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gives back the checkout accounting if `get` fails or is cancelled half-way.
struct CheckoutGuard<'a, M: Manager> {
    pool: &'a PoolInner<M>,
    armed: bool,
}

impl<M: Manager> Drop for CheckoutGuard<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.checked_in();
        }
    }
}

/// A resource checked out of a [`ResourcePool`].
///
/// Use it as if it was a `M::Type`: it goes back to the pool when dropped.
#[must_use]
pub struct Object<M: Manager> {
    obj: Option<M::Type>,
    pool: Arc<PoolInner<M>>,
    // Released after the resource is back in the idle set, so the next waiter reuses it.
    permit: Option<OwnedSemaphorePermit>,
}

impl<M: Manager> Object<M> {
    /// Destroy the resource instead of returning it to the pool.
    ///
    /// Use it when the resource hit a terminal error. The resource is destroyed even if the
    /// returned future is dropped before completion.
    pub async fn discard(mut this: Self) {
        if let Some(obj) = this.obj.take() {
            let permit = this.permit.take();
            if let Some(destroyed) = this.pool.destroy_detached(obj, permit) {
                if let Err(e) = destroyed.await {
                    error!(error = %e, "Failed to destroy a discarded resource");
                }
            }
        }
    }

    /// Return the resource to the pool, destroying it first if it is broken.
    pub async fn release(mut this: Self) {
        if let Some(obj) = this.obj.take() {
            let permit = this.permit.take();
            if this.pool.manager.is_broken(&obj) {
                if let Some(destroyed) = this.pool.destroy_detached(obj, permit) {
                    if let Err(e) = destroyed.await {
                        error!(error = %e, "Failed to destroy a broken resource");
                    }
                }
            } else {
                this.pool.return_object(obj, permit);
            }
        }
    }
}

impl<M: Manager> Drop for Object<M> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            let permit = self.permit.take();
            self.pool.return_object(obj, permit);
        }
    }
}

impl<M: Manager> Deref for Object<M> {
    type Target = M::Type;

    fn deref(&self) -> &M::Type {
        // Only `discard`/`release`/`drop` take the resource out, and they consume the object.
        match self.obj.as_ref() {
            Some(obj) => obj,
            None => unreachable!("pooled object accessed after being returned"),
        }
    }
}

impl<M: Manager> AsRef<M::Type> for Object<M> {
    fn as_ref(&self) -> &M::Type {
        self
    }
}
