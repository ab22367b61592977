//! Background archive writer.
//!
//! A single dedicated thread consumes block updates from a bounded
//! channel and appends them to the archive, decoupling block processing
//! from archive I/O. The producer blocks when the queue is full
//! (backpressure); writer-side failures surface on the producer's next
//! enqueue or flush via a second, non-blockingly drained channel.

use crate::archive::Archive;
use crate::error::ArchiveError;
use amber_common::types::Update;
use amber_common::{BlockNumber, Hash};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Capacity of the update queue and the error queue.
const QUEUE_CAPACITY: usize = 10;

enum WriterMessage {
    Add {
        block: BlockNumber,
        update: Update,
        hint: Option<Hash>,
    },
    /// Drain barrier: acknowledged once every prior message is processed.
    Flush(SyncSender<()>),
}

pub struct ArchiveWriter {
    sender: Option<SyncSender<WriterMessage>>,
    errors: Receiver<ArchiveError>,
    handle: Option<JoinHandle<()>>,
}

impl ArchiveWriter {
    pub fn spawn(archive: Archive) -> Result<Self, std::io::Error> {
        let (sender, receiver) = sync_channel::<WriterMessage>(QUEUE_CAPACITY);
        let (error_sender, errors) = sync_channel::<ArchiveError>(QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("archive-writer".into())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        WriterMessage::Add {
                            block,
                            update,
                            hint,
                        } => {
                            if let Err(err) = archive.add(block, &update, hint) {
                                error!("archive writer failed to add block {block}: {err}");
                                // dropped if the error queue is full; the
                                // archive itself stays invalidated
                                let _ = error_sender.try_send(err);
                            }
                        }
                        WriterMessage::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                debug!("archive writer drained and stopped");
            })?;
        Ok(Self {
            sender: Some(sender),
            errors,
            handle: Some(handle),
        })
    }

    /// Enqueues one block update; blocks while the queue is full. Any
    /// error the writer hit since the last call surfaces here first.
    pub fn enqueue(
        &self,
        block: BlockNumber,
        update: Update,
        hint: Option<Hash>,
    ) -> Result<(), ArchiveError> {
        self.drain_errors()?;
        let sender = self.sender.as_ref().ok_or(ArchiveError::WriterGone)?;
        sender
            .send(WriterMessage::Add {
                block,
                update,
                hint,
            })
            .map_err(|_| ArchiveError::WriterGone)
    }

    /// Blocks until every enqueued update has been processed.
    pub fn flush(&self) -> Result<(), ArchiveError> {
        let sender = self.sender.as_ref().ok_or(ArchiveError::WriterGone)?;
        let (ack_sender, ack) = sync_channel(1);
        sender
            .send(WriterMessage::Flush(ack_sender))
            .map_err(|_| ArchiveError::WriterGone)?;
        ack.recv().map_err(|_| ArchiveError::WriterGone)?;
        self.drain_errors()
    }

    /// Closes the queue, waits for the writer to drain and exit, and
    /// surfaces any pending error. Idempotent.
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        if let Some(sender) = self.sender.take() {
            drop(sender);
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| ArchiveError::Corrupted("archive writer panicked".into()))?;
        }
        self.drain_errors()
    }

    /// Surfaces the oldest pending writer error without blocking.
    fn drain_errors(&self) -> Result<(), ArchiveError> {
        match self.errors.try_recv() {
            Ok(err) => Err(err),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(()),
        }
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("archive writer close on drop failed: {err}");
        }
    }
}
