//! In-memory dispatch queue feeding the worker pool.
//!
//! Two FIFO lanes behind one mutex, plus a semaphore holding one permit per
//! queued item. Urgent items (accepted connections) are always taken before
//! normal ones (queued jobs); within a lane order is strict FIFO. Each item
//! is popped under the lock, so it reaches exactly one consumer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};

use crate::job::StoredJob;
use crate::state::ServerState;

/// Work handed to a worker.
#[derive(Debug)]
pub enum WorkItem {
    /// An accepted inbound HTTP connection.
    Connection(TcpStream, SocketAddr),
    /// A claimed job from the durable store.
    Job(StoredJob),
    /// Tells the receiving worker to exit.
    Stop,
}

/// The queue type used by the server.
pub type WorkQueue = DispatchQueue<WorkItem>;

#[derive(Debug)]
struct Lanes<T> {
    urgent: VecDeque<T>,
    normal: VecDeque<T>,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }
}

/// Two-priority FIFO shared by producers and workers.
#[derive(Debug)]
pub struct DispatchQueue<T> {
    lanes: Mutex<Lanes<T>>,
    available: Semaphore,
    state: Arc<ServerState>,
}

impl<T> DispatchQueue<T> {
    /// Create an empty queue reporting its depth into `state`.
    #[must_use]
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
            }),
            available: Semaphore::new(0),
            state,
        }
    }

    /// Add an item. Urgent items go ahead of every normal item.
    pub async fn post(&self, item: T, urgent: bool) {
        {
            let mut lanes = self.lanes.lock().await;
            if urgent {
                lanes.urgent.push_back(item);
            } else {
                lanes.normal.push_back(item);
            }
            self.state.record_queue_depth(lanes.len());
        }
        self.available.add_permits(1);
    }

    /// Wait for an item and remove it. Returns `None` only if the permit
    /// semaphore has been closed.
    pub async fn take(&self) -> Option<T> {
        loop {
            self.available.acquire().await.ok()?.forget();

            let mut lanes = self.lanes.lock().await;
            let item = lanes.urgent.pop_front().or_else(|| lanes.normal.pop_front());
            self.state.record_queue_depth(lanes.len());
            if item.is_some() {
                return item;
            }
        }
    }

    /// Number of queued items.
    pub async fn len(&self) -> usize {
        self.lanes.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
