use carrot_rpc::client::RpcClient;
use carrot_rpc::pool::{Manager, ResourcePool};
use carrot_rpc::server::{RpcServer, RpcServerError, ServerState};
use carrot_rpc::transport::memory::InMemoryBroker;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub fn random_queue() -> String {
    Uuid::new_v4().to_string()
}

pub fn get_pool(broker: &InMemoryBroker) -> ResourcePool<InMemoryBroker> {
    ResourcePool::builder(broker.clone())
        .max_size(4)
        .build()
        .unwrap()
}

pub fn get_client(broker: &InMemoryBroker) -> RpcClient<InMemoryBroker> {
    RpcClient::builder(get_pool(broker))
        .default_timeout(Duration::from_secs(5))
        .build()
}

/// An `RpcServer` listening in a background task.
pub struct RunningServer {
    pub server: RpcServer<InMemoryBroker>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), RpcServerError>>,
}

impl RunningServer {
    pub async fn start(server: RpcServer<InMemoryBroker>, queue: &str) -> Self {
        let mut state = server.watch_state();
        let (shutdown, on_shutdown) = oneshot::channel::<()>();
        let handle = tokio::spawn({
            let server = server.clone();
            let queue = queue.to_owned();
            async move {
                server
                    .listen_until_shutdown(&queue, async {
                        let _ = on_shutdown.await;
                    })
                    .await
            }
        });
        wait_for_state(&mut state, ServerState::Listening).await;
        Self {
            server,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) -> Result<(), RpcServerError> {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap()
    }
}

pub async fn wait_for_state(state: &mut watch::Receiver<ServerState>, expected: ServerState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow_and_update() == expected {
                return;
            }
            state.changed().await.unwrap();
        }
    })
    .await;
    assert!(reached.is_ok(), "The server never reached {:?}", expected);
}

/// A pool manager handing out numbered resources and recording their fate.
#[derive(Default)]
pub struct CountingManager {
    created: AtomicUsize,
    destroyed: Mutex<Vec<usize>>,
    broken: Mutex<HashSet<usize>>,
    fail_creation: AtomicBool,
    destroy_delay: Mutex<Duration>,
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

impl CountingManager {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<usize> {
        let mut destroyed = self.destroyed.lock().unwrap().clone();
        destroyed.sort_unstable();
        destroyed
    }

    pub fn break_resource(&self, id: usize) {
        self.broken.lock().unwrap().insert(id);
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Make every `destroy` take `delay` before the resource is gone.
    pub fn slow_destroy(&self, delay: Duration) {
        *self.destroy_delay.lock().unwrap() = delay;
    }

    /// The highest number of resources that were alive at the same time.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Manager for CountingManager {
    type Type = usize;

    async fn create(&self) -> Result<usize, anyhow::Error> {
        if self.fail_creation.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn destroy(&self, id: usize) -> Result<(), anyhow::Error> {
        let delay = *self.destroy_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.destroyed.lock().unwrap().push(id);
        Ok(())
    }

    fn is_broken(&self, id: &usize) -> bool {
        self.broken.lock().unwrap().contains(id)
    }
}
