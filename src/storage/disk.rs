use std::net::SocketAddr;
use std::sync::Arc;

use bit_set::BitSet;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::core::Sha1;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::message::{Block, BlockData, Message};
use crate::storage::layout::FileLayout;
use crate::storage::piece_store::{AssembledPiece, PieceStore, WriteOutcome};
use crate::torrent::Info;

enum StorageCommand {
    Write(SocketAddr, BlockData),
    Read(Block, Sender<Message>),
}

/// Storage task of one session.
///
/// Blocks are assembled in memory; complete pieces are hashed and written on the engine-wide
/// disk worker pool. Results are reported to the session as events.
///
/// The command queue is bounded: when the disk falls behind, `write` waits, which holds up
/// the session and in turn the connections feeding it.
pub struct Storage {
    tx: Sender<StorageCommand>,
    join_handle: JoinHandle<()>,
}

impl Storage {
    /// Prepares the files and checks which pieces are already on disk.
    pub async fn open(info: &Info, layout: &FileLayout, disk: &Semaphore) -> Result<BitSet> {
        let existing = check_existing(info, layout, disk).await?;
        layout
            .allocate()
            .await
            .map_err(|err| Error::StorageError(err.to_string()))?;
        Ok(existing)
    }

    pub fn spawn(
        info: Arc<Info>,
        layout: FileLayout,
        store: PieceStore,
        disk: Arc<Semaphore>,
        events: Sender<Event>,
        queue: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue);
        let worker = Worker {
            info,
            layout,
            store,
            disk,
            events,
        };
        let join_handle = tokio::spawn(worker.run(rx));
        Self { tx, join_handle }
    }

    pub async fn write(&self, contributor: SocketAddr, block_data: BlockData) {
        let command = StorageCommand::Write(contributor, block_data);
        if self.tx.send(command).await.is_err() {
            warn!("storage already stopped");
        }
    }

    /// Reads a block of a verified piece and queues it to the peer.
    pub async fn read(&self, block: Block, peer: Sender<Message>) {
        if self.tx.send(StorageCommand::Read(block, peer)).await.is_err() {
            warn!("storage already stopped");
        }
    }

    /// Finishes pending writes, then stops the task.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.join_handle.await {
            warn!("storage task failed: {}", err);
        }
    }
}

struct Worker {
    info: Arc<Info>,
    layout: FileLayout,
    store: PieceStore,
    disk: Arc<Semaphore>,
    events: Sender<Event>,
}

impl Worker {
    async fn run(mut self, mut rx: Receiver<StorageCommand>) {
        while let Some(command) = rx.recv().await {
            let result = match command {
                StorageCommand::Write(contributor, block_data) => {
                    self.write(contributor, block_data).await
                }
                StorageCommand::Read(block, peer) => self.read(block, peer).await,
            };
            if let Err(err) = result {
                error!("storage failed: {}", err);
                self.report(Event::StorageFailed(err));
                break;
            }
        }
        debug!("storage task stopped");
    }

    async fn write(&mut self, contributor: SocketAddr, block_data: BlockData) -> Result<()> {
        let block = Block::from(&block_data);
        let outcome = match self.store.write_block(block_data, contributor) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("dropping block {:?} from {}: {}", block, contributor, err);
                return Ok(());
            }
        };
        let assembled = match outcome {
            WriteOutcome::Incomplete => return Ok(()),
            WriteOutcome::Duplicate => {
                debug!("ignoring duplicate block {:?}", block);
                return Ok(());
            }
            WriteOutcome::Assembled(assembled) => assembled,
        };

        let piece = assembled.piece;
        let expected = self.info.pieces[piece];
        let _permit = self.disk.acquire().await.map_err(|_| Error::Channel)?;
        let (assembled, valid) = verify(assembled, expected).await?;
        let event = if valid {
            self.layout
                .write(assembled.offset, &assembled.data)
                .await
                .map_err(|err| Error::StorageError(err.to_string()))?;
            self.store.verified(piece);
            info!("piece {} verified", piece);
            Event::PieceCompleted(piece)
        } else {
            warn!("{}", Error::HashMismatch(piece));
            self.store.failed(piece);
            Event::PieceVerificationFailed {
                piece,
                contributors: assembled.contributors,
            }
        };
        self.report(event);
        Ok(())
    }

    /// The session may itself be waiting on the storage queue, so reports never block.
    fn report(&self, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            if events.send(event).await.is_err() {
                debug!("session gone, dropping storage event");
            }
        });
    }

    async fn read(&self, block: Block, peer: Sender<Message>) -> Result<()> {
        if !self.store.is_verified(block.piece) {
            warn!("refusing to read block {:?} of unverified piece", block);
            return Ok(());
        }
        let offset = block.global_offset(self.info.piece_size);
        let _permit = self.disk.acquire().await.map_err(|_| Error::Channel)?;
        let data = self
            .layout
            .read(offset, block.length)
            .await
            .map_err(|err| Error::StorageError(err.to_string()))?
            .ok_or_else(|| Error::StorageError(format!("piece {} missing on disk", block.piece)))?;
        // A slow peer must not hold up the storage task
        tokio::spawn(async move {
            let _ = peer.send(Message::Piece(BlockData::new(block, data))).await;
        });
        Ok(())
    }
}

/// Hashes the piece off the async workers. The caller holds a disk permit.
async fn verify(assembled: AssembledPiece, expected: Sha1) -> Result<(AssembledPiece, bool)> {
    tokio::task::spawn_blocking(move || {
        let valid = assembled.matches(&expected);
        (assembled, valid)
    })
    .await
    .map_err(|err| Error::StorageError(err.to_string()))
}

async fn check_existing(info: &Info, layout: &FileLayout, disk: &Semaphore) -> Result<BitSet> {
    let mut has_pieces = BitSet::with_capacity(info.total_pieces());
    for piece in 0..info.total_pieces() {
        let data = layout
            .read(info.piece_offset(piece), info.piece_size(piece))
            .await
            .map_err(|err| Error::StorageError(err.to_string()))?;
        let Some(data) = data else {
            continue;
        };
        let _permit = disk.acquire().await.map_err(|_| Error::Channel)?;
        let expected = info.pieces[piece];
        let valid = tokio::task::spawn_blocking(move || Sha1::digest(&data) == expected)
            .await
            .map_err(|err| Error::StorageError(err.to_string()))?;
        if valid {
            has_pieces.insert(piece);
        }
    }
    if !has_pieces.is_empty() {
        info!(
            "found {}/{} pieces of {} on disk",
            has_pieces.len(),
            info.total_pieces(),
            info.name()
        );
    }
    Ok(has_pieces)
}
