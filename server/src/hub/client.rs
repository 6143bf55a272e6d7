//! Client abstraction shared by the socket and long-poll transports.
//!
//! The hub owns every registered [`Client`]. Transport tasks only keep a
//! [`ClientHandle`]: the id, the connection sequence number and the
//! cancellation token used to tear the connection down.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ClientId = String;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Use the id the client asked for, or derive one from its address and the
/// current time as `"{ip}-{nanos}"`.
pub fn derive_client_id(requested: Option<String>, addr: SocketAddr) -> ClientId {
    match requested.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            format!("{}-{}", addr.ip(), nanos)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    LongPoll,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::LongPoll => "long_poll",
        }
    }
}

/// Why a connection was closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport ended or client unregistered itself.
    Normal,
    /// Another connection registered under the same id.
    Superseded,
    /// Outbound queue overflowed during routing.
    SlowConsumer,
    /// Server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Shutdown => 1001,
            Self::SlowConsumer => 1008,
            Self::Superseded => 4000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Superseded => "superseded",
            Self::SlowConsumer => "slow consumer",
            Self::Shutdown => "server shutdown",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// Control block shared between the hub and a connection's tasks.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    seq: u64,
    kind: TransportKind,
    token: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

impl ClientHandle {
    fn new(id: ClientId, kind: TransportKind) -> Self {
        Self {
            id,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            kind,
            token: CancellationToken::new(),
            close_reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record the close reason (first one wins) and cancel the connection.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.token.cancel();
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason.get().copied().unwrap_or(CloseReason::Normal)
    }

}

/// Outbound half of a transport. Both variants accept pre-encoded frames and
/// never block the caller.
#[derive(Debug)]
pub enum Transport {
    Socket { outbound: mpsc::Sender<Bytes> },
    LongPoll { slot: mpsc::Sender<Bytes> },
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Socket { .. } => TransportKind::Socket,
            Self::LongPoll { .. } => TransportKind::LongPoll,
        }
    }

    pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
        let sender = match self {
            Self::Socket { outbound } => outbound,
            Self::LongPoll { slot } => slot,
        };
        sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// A registered connection as owned by the hub.
#[derive(Debug)]
pub struct Client {
    handle: ClientHandle,
    transport: Transport,
    room: Option<String>,
}

impl Client {
    /// Create a socket client with a bounded outbound queue. The receiver is
    /// drained by the connection's write task.
    pub fn socket(
        id: impl Into<ClientId>,
        room: Option<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            handle: ClientHandle::new(id.into(), TransportKind::Socket),
            transport: Transport::Socket { outbound: tx },
            room: room.filter(|r| !r.is_empty()),
        };
        (client, rx)
    }

    /// Create a long-poll client around a rendezvous slot.
    pub fn long_poll(id: impl Into<ClientId>, room: Option<String>, slot: mpsc::Sender<Bytes>) -> Self {
        Self {
            handle: ClientHandle::new(id.into(), TransportKind::LongPoll),
            transport: Transport::LongPoll { slot },
            room: room.filter(|r| !r.is_empty()),
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
        self.transport.try_enqueue(frame)
    }

    /// Close the client. Dropping `self` drops the outbound sender, which is
    /// the terminal signal for the socket write task.
    pub fn close(self, reason: CloseReason) {
        self.handle.close(reason);
    }
}
