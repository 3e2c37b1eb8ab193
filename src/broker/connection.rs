//! Connection registry: identity, liveness bookkeeping, outbound queues
//!
//! Each live connection owns a bounded outbound queue drained by a single
//! writer task, which is what serializes frame writes per channel. The
//! registry assigns monotonic ids that are never reused within a process.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain_types::{ConnectionId, QueueCapacity};
use crate::error::BrokerError;
use crate::protocol::{CapabilitySet, ClientSummary, Frame, Role};
use crate::time_provider::SharedTimeProvider;

/// One live connection as seen by the broker
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub role: Role,
    pub user_session: String,
    pub capabilities: CapabilitySet,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub client_start_time: Option<DateTime<Utc>>,
    /// Epoch milliseconds of the last inbound activity
    last_activity_ms: AtomicI64,
    /// Feed to the connection's writer task
    outbound: mpsc::Sender<Frame>,
    /// Cancelled to force the socket tasks down
    pub shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Records inbound activity at `now`
    pub fn touch(&self, now: DateTime<Utc>) {
        self.last_activity_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    /// Last inbound activity
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    fn summary(&self) -> ClientSummary {
        ClientSummary {
            id: self.id,
            role: self.role,
            user_session: self.user_session.clone(),
            capabilities: self.capabilities.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_activity(),
            remote_addr: self.remote_addr.clone(),
            client_start_time: self.client_start_time,
        }
    }
}

/// Registration data carried by the first frame
#[derive(Debug, Clone)]
pub struct Registration {
    pub role: Role,
    pub user_session: String,
    pub capabilities: CapabilitySet,
    pub client_start_time: Option<DateTime<Utc>>,
    pub remote_addr: Option<String>,
}

/// Registry of live connections keyed by id
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
    outbound_capacity: QueueCapacity,
    time: SharedTimeProvider,
}

impl ConnectionRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new(outbound_capacity: QueueCapacity, time: SharedTimeProvider) -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
            outbound_capacity,
            time,
        }
    }

    /// Registers a connection and returns its handle plus the queue receiver
    /// the caller must drain in a writer task
    pub fn register(
        &self,
        registration: Registration,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.outbound_capacity.as_usize());
        let now = self.time.now_utc();
        let handle = Arc::new(ConnectionHandle {
            id,
            role: registration.role,
            user_session: registration.user_session,
            capabilities: registration.capabilities,
            remote_addr: registration.remote_addr,
            connected_at: now,
            client_start_time: registration.client_start_time,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            outbound: tx,
            shutdown: CancellationToken::new(),
        });
        self.conns.insert(id, Arc::clone(&handle));
        debug!(
            connection = %id,
            role = %handle.role,
            session = %handle.user_session,
            "connection registered"
        );
        (handle, rx)
    }

    /// Removes a connection; the id is retired, never reused
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.conns.remove(&id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            handle.shutdown.cancel();
            debug!(connection = %id, "connection removed");
        }
        removed
    }

    /// Looks up a connection by id
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.conns.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Records inbound activity for a connection
    pub fn touch(&self, id: ConnectionId) {
        if let Some(handle) = self.conns.get(&id) {
            handle.touch(self.time.now_utc());
        }
    }

    /// Enqueues a frame toward a connection
    ///
    /// # Errors
    ///
    /// `NoSuchConnection` when the target is gone; `SlowConsumer` when its
    /// outbound queue is full, in which case the connection is shut down.
    pub fn enqueue(&self, id: ConnectionId, frame: Frame) -> Result<(), BrokerError> {
        let handle = self.get(id).ok_or(BrokerError::NoSuchConnection(id))?;
        match handle.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %id, "outbound queue overflow, closing slow consumer");
                handle.shutdown.cancel();
                Err(BrokerError::SlowConsumer(id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(BrokerError::ConnectionClosed(id))
            }
        }
    }

    /// Snapshot of all live connections for `list_clients`
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientSummary> {
        let mut clients: Vec<ClientSummary> =
            self.conns.iter().map(|entry| entry.value().summary()).collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Connections whose last activity is older than `max_idle`
    #[must_use]
    pub fn idle_connections(&self, max_idle: std::time::Duration) -> Vec<ConnectionId> {
        let now = self.time.now_utc();
        let cutoff = now
            - chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.conns
            .iter()
            .filter(|entry| entry.value().last_activity() < cutoff)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no connections are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
