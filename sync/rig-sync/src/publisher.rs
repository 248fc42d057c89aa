use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info};
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

use crate::{Error, Result, SyncMessage, SyncPublish};

/// The PUB side of the channel.
pub struct SyncPublisher {
    socket: PubSocket,
    endpoint: String,
}

impl SyncPublisher {
    /// Bind to `endpoint`. A port of 0 picks a free port; see
    /// [Self::endpoint] for the address actually bound.
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let mut socket = PubSocket::new();
        let bound = socket.bind(endpoint).await?;
        let endpoint = bound.to_string();
        info!("sync publisher bound to {endpoint}");
        Ok(Self { socket, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send(&mut self, msg: SyncMessage) -> Result<()> {
        debug!("publishing {msg}");
        self.socket.send(ZmqMessage::from(msg.as_wire())).await?;
        Ok(())
    }

    /// Move the socket into a task on the current tokio runtime. The
    /// returned handle can be used from any thread.
    pub fn spawn(mut self) -> PublisherHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncMessage>();
        let endpoint = self.endpoint.clone();
        let join = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = self.send(msg).await {
                    error!("sending {msg}: {e}");
                }
            }
            debug!("sync publisher on {} done", self.endpoint);
        });
        PublisherHandle { tx, endpoint, join }
    }
}

/// Queues messages for a spawned [SyncPublisher].
///
/// A single task drains the queue so messages go out in submission order.
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<SyncMessage>,
    endpoint: String,
    join: JoinHandle<()>,
}

impl PublisherHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// A sender which can be moved to another thread.
    pub fn sender(&self) -> PublisherSender {
        PublisherSender {
            tx: self.tx.clone(),
        }
    }

    /// Send everything queued so far, then close the socket. Waits until
    /// every [PublisherSender] has been dropped.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.join.await {
            error!("sync publisher task: {e}");
        }
    }
}

impl SyncPublish for PublisherHandle {
    fn publish(&self, msg: SyncMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::PublisherGone)
    }
}

/// A cloneable [SyncPublish] feeding a [PublisherHandle]'s task.
#[derive(Clone)]
pub struct PublisherSender {
    tx: mpsc::UnboundedSender<SyncMessage>,
}

impl SyncPublish for PublisherSender {
    fn publish(&self, msg: SyncMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::PublisherGone)
    }
}
