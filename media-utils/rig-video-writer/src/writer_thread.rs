//! [BgRecordingWriter] moves an open [RecordingSink] into a dedicated thread.
//! Everything the thread does happens in [writer_thread_loop].

use std::{sync::Arc, thread::JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use rig_camera::Frame;

use crate::{Error, RecordingSink, Result, SessionSummary};

/// From outside the worker thread, check if we received an error from the
/// thread.
macro_rules! poll_err {
    ($err_rx: expr) => {{
        if let Some(e) = $err_rx.lock().take() {
            return Err(e);
        }
    }};
}

pub(crate) enum Msg {
    Write(Arc<Frame>),
    Finish,
}

/// A recording sink driven from a background thread.
///
/// Frames are queued in a bounded channel. When the queue is full,
/// [Self::write] blocks until the writer catches up, so no frame is dropped.
pub struct BgRecordingWriter {
    tx: Option<Sender<Msg>>,
    err_from_worker: Arc<Mutex<Option<Error>>>,
    handle: Option<JoinHandle<Option<SessionSummary>>>,
    congested: bool,
}

impl BgRecordingWriter {
    /// Spawn the writer thread. `sink` must already be open.
    ///
    /// `queue_size` is the number of frames that can be buffered before
    /// [Self::write] blocks.
    pub fn new(sink: RecordingSink, queue_size: usize) -> Result<Self> {
        if !sink.is_open() {
            return Err(Error::NotOpen);
        }
        let err_to_launcher = Arc::new(Mutex::new(None));
        let err_from_worker = err_to_launcher.clone();
        let (tx, rx) = crossbeam_channel::bounded::<Msg>(queue_size.max(1));
        let handle = std::thread::Builder::new()
            .name("recording-writer".to_string())
            .spawn(move || writer_thread_loop(sink, err_to_launcher, rx))?;
        Ok(Self {
            tx: Some(tx),
            err_from_worker,
            handle: Some(handle),
            congested: false,
        })
    }

    /// Enqueue a frame for writing.
    ///
    /// If the background writer thread has previously encountered an error,
    /// this will return that previously-encountered error.
    pub fn write(&mut self, frame: Arc<Frame>) -> Result<()> {
        poll_err!(self.err_from_worker);
        let tx = self.tx.as_ref().ok_or(Error::AlreadyDone)?;
        let msg = match tx.try_send(Msg::Write(frame)) {
            Ok(()) => {
                self.congested = false;
                return Ok(());
            }
            Err(TrySendError::Disconnected(_)) => return Err(self.worker_gone()),
            Err(TrySendError::Full(msg)) => msg,
        };
        if !self.congested {
            tracing::warn!("recording queue full, waiting for writer");
            self.congested = true;
        }
        if tx.send(msg).is_err() {
            return Err(self.worker_gone());
        }
        Ok(())
    }

    /// Number of frames queued but not yet written.
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    fn worker_gone(&self) -> Error {
        self.err_from_worker
            .lock()
            .take()
            .unwrap_or(Error::WorkerDisconnected)
    }

    /// Write all queued frames, finalize the container and stop the thread.
    pub fn finish(mut self) -> Result<SessionSummary> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<SessionSummary> {
        let tx = self.tx.take().ok_or(Error::AlreadyDone)?;
        // Blocks until the queued frames ahead of it are written.
        let sent = tx.send(Msg::Finish);
        drop(tx);
        let handle = self.handle.take().ok_or(Error::AlreadyDone)?;
        let summary = handle.join().map_err(|_| Error::WorkerDisconnected)?;
        poll_err!(self.err_from_worker);
        if sent.is_err() {
            return Err(Error::WorkerDisconnected);
        }
        summary.ok_or(Error::WorkerDisconnected)
    }
}

impl Drop for BgRecordingWriter {
    fn drop(&mut self) {
        if self.tx.is_some() {
            if let Err(e) = self.finish_inner() {
                tracing::error!("finishing recording on drop: {e}");
            }
        }
    }
}

/// Runs in the writer thread until [Msg::Finish] arrives, the sender is
/// dropped, or an error occurs. Errors are stored in `err_tx`.
fn writer_thread_loop(
    mut sink: RecordingSink,
    err_tx: Arc<Mutex<Option<Error>>>,
    rx: Receiver<Msg>,
) -> Option<SessionSummary> {
    let store = |e: Error| {
        tracing::error!("recording writer: {e}");
        err_tx.lock().replace(e);
    };
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Write(frame) => {
                if let Err(e) = sink.write(&frame) {
                    store(e);
                    // Finalize what was written so far.
                    if let Err(e) = sink.close() {
                        tracing::error!("closing after failure: {e}");
                    }
                    return None;
                }
            }
            Msg::Finish => break,
        }
    }
    match sink.close() {
        Ok(summary) => summary,
        Err(e) => {
            store(e);
            None
        }
    }
}
