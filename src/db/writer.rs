//! Group commit.
//!
//! Writers hand their batch to a dedicated thread and block on a reply. The
//! thread takes the first waiting batch, gathers more for up to `batch_wait`
//! (at most `max_batch_size` in total), commits them as one log record and
//! replies to every writer with the same result.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::store::DbInner;
use crate::batch::WriteBatch;
use crate::error::{Error, Result};

struct WriteRequest {
    batch: WriteBatch,
    done: SyncSender<Result<()>>,
}

pub(crate) struct WriteQueue {
    sender: Mutex<Option<Sender<WriteRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn start(db: Arc<DbInner>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("lsmkv-writer".to_string())
            .spawn(move || run(db, receiver))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Blocks until `batch` is durable and visible, or has failed.
    pub fn submit(&self, batch: WriteBatch) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::ShuttingDown)?;

        let (done, reply) = mpsc::sync_channel(1);
        sender
            .send(WriteRequest { batch, done })
            .map_err(|_| Error::ShuttingDown)?;
        drop(sender);

        reply.recv().map_err(|_| Error::ShuttingDown)?
    }

    /// Stops accepting writes, lets queued ones finish and joins the thread.
    pub fn stop(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Write queue thread panicked");
            }
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(db: Arc<DbInner>, receiver: Receiver<WriteRequest>) {
    let max_batch_size = db.config.max_batch_size.max(1);
    let batch_wait = db.config.batch_wait;

    while let Ok(first) = receiver.recv() {
        let mut group = vec![first];
        while group.len() < max_batch_size {
            match receiver.recv_timeout(batch_wait) {
                Ok(request) => group.push(request),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let result = if group.len() == 1 {
            db.commit(&group[0].batch)
        } else {
            let mut combined = WriteBatch::new();
            for request in &group {
                combined.append(&request.batch);
            }
            db.commit(&combined)
        };

        if let Err(e) = &result {
            tracing::warn!(writes = group.len(), error = %e, "Group commit failed");
        }
        for request in group {
            // The writer may have given up waiting.
            let _ = request.done.send(result.clone());
        }
    }

    tracing::debug!("Write queue stopped");
}
