use crossbeam_channel::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::{Error, Result, SyncMessage};

/// Consecutive receive errors after which the subscriber gives up.
const MAX_RECV_ERRORS: u32 = 100;

/// The SUB side of the channel, subscribed to all messages.
pub struct SyncSubscriber {
    socket: SubSocket,
    endpoint: String,
}

impl SyncSubscriber {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let mut socket = SubSocket::new();
        socket.connect(endpoint).await?;
        socket.subscribe("").await?;
        info!("sync subscriber connected to {endpoint}");
        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
        })
    }

    /// Receive the next message. A malformed payload is returned as
    /// [Error::Protocol]; the subscriber remains usable.
    pub async fn recv(&mut self) -> Result<SyncMessage> {
        let msg = self.socket.recv().await?;
        let frames = msg.into_vec();
        let payload = frames.first().map(|b| &b[..]).unwrap_or(&[]);
        SyncMessage::parse(payload)
    }

    /// Forward well-formed messages to `tx` in arrival order until `tx` is
    /// disconnected. Malformed messages are logged and dropped.
    pub async fn run(mut self, tx: Sender<SyncMessage>) -> Result<()> {
        let mut error_count = 0;
        loop {
            let msg = match self.recv().await {
                Ok(msg) => msg,
                Err(Error::Protocol(payload)) => {
                    warn!("ignoring malformed sync message {payload:?}");
                    continue;
                }
                Err(e) => {
                    error_count += 1;
                    error!("sync receive error: {e}");
                    if error_count > MAX_RECV_ERRORS {
                        return Err(e);
                    }
                    continue;
                }
            };
            error_count = 0;
            debug!("received {msg}");
            if tx.send(msg).is_err() {
                info!("sync receiver for {} closed, stopping", self.endpoint);
                return Ok(());
            }
        }
    }

    /// Run [Self::run] as a task on the current tokio runtime.
    pub fn spawn(self, tx: Sender<SyncMessage>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(tx))
    }
}
