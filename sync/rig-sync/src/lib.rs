//! Recording control messages between a stimulation controller and a
//! recording controller.
//!
//! The stimulation side binds a ZeroMQ PUB socket ([SyncPublisher]), the
//! recording side connects a SUB socket ([SyncSubscriber]) subscribed to
//! everything. Delivery is best effort: no acknowledgment, no retry and no
//! replay for subscribers which connect late.

use std::fmt;

mod publisher;
mod subscriber;

pub use publisher::{PublisherHandle, PublisherSender, SyncPublisher};
pub use subscriber::SyncSubscriber;

pub const START_RECORDING: &str = "START_RECORDING";
pub const STOP_RECORDING: &str = "STOP_RECORDING";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed sync message {0:?}")]
    Protocol(String),
    #[error("zmq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),
    #[error("publisher task has stopped")]
    PublisherGone,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The message vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMessage {
    StartRecording,
    StopRecording,
    /// Index of the trial whose recording starts next.
    TrialIndex(u32),
}

impl SyncMessage {
    pub fn as_wire(&self) -> String {
        match self {
            SyncMessage::StartRecording => START_RECORDING.to_string(),
            SyncMessage::StopRecording => STOP_RECORDING.to_string(),
            SyncMessage::TrialIndex(i) => i.to_string(),
        }
    }

    /// Parse one message payload.
    ///
    /// Anything which is not a control word must be a non-negative decimal
    /// integer to count as a trial index.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let s = std::str::from_utf8(payload)
            .map_err(|_| Error::Protocol(String::from_utf8_lossy(payload).into_owned()))?
            .trim();
        match s {
            START_RECORDING => Ok(SyncMessage::StartRecording),
            STOP_RECORDING => Ok(SyncMessage::StopRecording),
            _ if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s
                .parse()
                .map(SyncMessage::TrialIndex)
                .map_err(|_| Error::Protocol(s.to_string())),
            _ => Err(Error::Protocol(s.to_string())),
        }
    }
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

/// A TCP endpoint string for `host` and `port`.
pub fn endpoint(host: &str, port: u16) -> String {
    format!("tcp://{host}:{port}")
}

/// Sends sync messages without blocking the caller.
///
/// Messages from one publisher are delivered in the order they were passed
/// to [SyncPublish::publish].
pub trait SyncPublish: Send {
    fn publish(&self, msg: SyncMessage) -> Result<()>;
}

/// In-process delivery, for running both controllers in one process.
impl SyncPublish for crossbeam_channel::Sender<SyncMessage> {
    fn publish(&self, msg: SyncMessage) -> Result<()> {
        self.send(msg).map_err(|_| Error::PublisherGone)
    }
}

impl<P: SyncPublish + ?Sized> SyncPublish for Box<P> {
    fn publish(&self, msg: SyncMessage) -> Result<()> {
        (**self).publish(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_vocabulary() {
        assert_eq!(
            SyncMessage::parse(b"START_RECORDING").unwrap(),
            SyncMessage::StartRecording
        );
        assert_eq!(
            SyncMessage::parse(b"STOP_RECORDING\n").unwrap(),
            SyncMessage::StopRecording
        );
        assert_eq!(
            SyncMessage::parse(b"12").unwrap(),
            SyncMessage::TrialIndex(12)
        );
        for msg in [
            SyncMessage::StartRecording,
            SyncMessage::StopRecording,
            SyncMessage::TrialIndex(3),
        ] {
            assert_eq!(SyncMessage::parse(msg.as_wire().as_bytes()).unwrap(), msg);
        }
    }

    #[test]
    fn malformed_rejected() {
        for bad in [
            &b""[..],
            b"start_recording",
            b"-1",
            b"1.5",
            b"hello",
            b"99999999999",
            &[0xffu8, 0xfe][..],
        ] {
            assert!(
                matches!(SyncMessage::parse(bad), Err(Error::Protocol(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn endpoint_format() {
        assert_eq!(endpoint("127.0.0.1", 5555), "tcp://127.0.0.1:5555");
    }
}
