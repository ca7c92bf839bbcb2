//! Chunked file transfer coordination.
//!
//! Transfers share the client's one TCP connection with ordinary chat
//! traffic, multiplexed by message type. The coordinator never touches a
//! socket or its deadlines: upload chunks arrive through the session's
//! normal read loop, and download chunks leave through the session's
//! serialized write path. A stalled transfer is cancelled by the reaper;
//! the connection it rode on stays up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use parley_shared::protocol::{FileChunk, FileDownloadResponse, SystemMessage};
use parley_shared::types::{FileId, GroupId, TransferId, UserId};
use parley_shared::{unix_now, WireMessage};
use parley_store::FileRecord;

use crate::error::ServerError;
use crate::file_store::FileStore;
use crate::session::{SessionHandle, SessionId};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    Complete,
    Failed,
    Cancelled,
}

/// Book-keeping for one transfer in flight.
struct Transfer {
    id: TransferId,
    direction: Direction,
    session_id: SessionId,
    owner: SessionHandle,
    user_id: UserId,
    group_id: GroupId,
    file_name: String,
    total_size: u64,
    bytes_transferred: u64,
    next_seq: u32,
    status: TransferStatus,
    hasher: blake3::Hasher,
    last_activity: Instant,
}

pub struct TransferCoordinator {
    files: FileStore,
    storage: Arc<dyn Storage>,
    max_file_size: u64,
    chunk_size: u32,
    idle_timeout: Duration,
    /// Map lock is never held across an await; per-transfer state has its
    /// own async lock.
    transfers: Mutex<HashMap<TransferId, Arc<tokio::sync::Mutex<Transfer>>>>,
}

impl TransferCoordinator {
    pub fn new(
        files: FileStore,
        storage: Arc<dyn Storage>,
        max_file_size: u64,
        chunk_size: u32,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            files,
            storage,
            max_file_size,
            chunk_size,
            idle_timeout,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn insert(&self, transfer: Transfer) -> Arc<tokio::sync::Mutex<Transfer>> {
        let id = transfer.id;
        let arc = Arc::new(tokio::sync::Mutex::new(transfer));
        self.transfers
            .lock()
            .expect("transfer map lock poisoned")
            .insert(id, Arc::clone(&arc));
        arc
    }

    fn lookup(&self, id: TransferId) -> Option<Arc<tokio::sync::Mutex<Transfer>>> {
        self.transfers
            .lock()
            .expect("transfer map lock poisoned")
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: TransferId) {
        self.transfers
            .lock()
            .expect("transfer map lock poisoned")
            .remove(&id);
    }

    /// Validate and register an upload; the staging file is created here
    /// so the first chunk can append immediately.
    pub async fn begin_upload(
        &self,
        owner: &SessionHandle,
        user_id: UserId,
        group_id: GroupId,
        file_name: &str,
        total_size: u64,
    ) -> Result<TransferId, ServerError> {
        if file_name.is_empty() {
            return Err(ServerError::Transfer("file name must not be empty".into()));
        }
        if total_size == 0 {
            return Err(ServerError::Transfer("file must not be empty".into()));
        }
        if total_size > self.max_file_size {
            return Err(ServerError::FileTooLarge {
                size: total_size,
                max: self.max_file_size,
            });
        }

        let id = TransferId::new();
        self.files.create_staging(id).await?;

        self.insert(Transfer {
            id,
            direction: Direction::Upload,
            session_id: owner.id(),
            owner: owner.clone(),
            user_id,
            group_id,
            file_name: file_name.to_string(),
            total_size,
            bytes_transferred: 0,
            next_seq: 0,
            status: TransferStatus::Active,
            hasher: blake3::Hasher::new(),
            last_activity: Instant::now(),
        });

        info!(transfer = %id, file = file_name, size = total_size, "Upload accepted");
        Ok(id)
    }

    /// Apply one upload chunk. Returns the finished [`FileRecord`] on the
    /// final chunk, `None` while the upload is still in progress.
    pub async fn handle_chunk(
        &self,
        session_id: SessionId,
        chunk: FileChunk,
    ) -> Result<Option<FileRecord>, ServerError> {
        let arc = self
            .lookup(chunk.transfer_id)
            .ok_or_else(|| ServerError::Transfer(format!("unknown transfer {}", chunk.transfer_id)))?;

        let mut transfer = arc.lock().await;

        if transfer.session_id != session_id {
            return Err(ServerError::Transfer(
                "transfer belongs to another connection".into(),
            ));
        }
        if transfer.direction != Direction::Upload || transfer.status != TransferStatus::Active {
            return Err(ServerError::Transfer("transfer is not accepting data".into()));
        }

        if chunk.seq != transfer.next_seq {
            let reason = format!(
                "out-of-order chunk: expected {}, got {}",
                transfer.next_seq, chunk.seq
            );
            self.abort(&mut transfer, TransferStatus::Failed).await;
            return Err(ServerError::Transfer(reason));
        }

        let new_total = transfer.bytes_transferred + chunk.data.len() as u64;
        if new_total > transfer.total_size {
            self.abort(&mut transfer, TransferStatus::Failed).await;
            return Err(ServerError::Transfer("more data than announced".into()));
        }

        if let Err(e) = self.files.append_staging(transfer.id, &chunk.data).await {
            self.abort(&mut transfer, TransferStatus::Failed).await;
            return Err(e);
        }

        transfer.hasher.update(&chunk.data);
        transfer.bytes_transferred = new_total;
        transfer.next_seq += 1;
        transfer.last_activity = Instant::now();

        if transfer.bytes_transferred < transfer.total_size {
            return Ok(None);
        }

        // Final chunk: promote the staging file and persist the record.
        let file_id = FileId::new();
        if let Err(e) = self.files.promote_staging(transfer.id, file_id).await {
            self.abort(&mut transfer, TransferStatus::Failed).await;
            return Err(e);
        }

        let record = FileRecord {
            id: file_id,
            group_id: transfer.group_id,
            uploader_id: transfer.user_id,
            file_name: transfer.file_name.clone(),
            size_bytes: transfer.total_size as i64,
            blake3_hex: transfer.hasher.finalize().to_hex().to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.record_file(&record) {
            transfer.status = TransferStatus::Failed;
            self.remove(transfer.id);
            return Err(e.into());
        }

        transfer.status = TransferStatus::Complete;
        self.remove(transfer.id);
        info!(
            transfer = %transfer.id,
            file = %record.id,
            name = %record.file_name,
            "Upload complete"
        );
        Ok(Some(record))
    }

    /// Register a download and spawn its streaming task. Chunks flow
    /// through the requester's outbound channel; the task holds no lock
    /// while waiting on file I/O other than its own transfer's.
    pub async fn begin_download(
        self: &Arc<Self>,
        requester: &SessionHandle,
        user_id: UserId,
        record: &FileRecord,
    ) -> Result<TransferId, ServerError> {
        // Open first so a missing blob fails the request, not the stream.
        let file = self.files.open_blob(record.id).await?;

        let id = TransferId::new();
        let arc = self.insert(Transfer {
            id,
            direction: Direction::Download,
            session_id: requester.id(),
            owner: requester.clone(),
            user_id,
            group_id: record.group_id,
            file_name: record.file_name.clone(),
            total_size: record.size_bytes as u64,
            bytes_transferred: 0,
            next_seq: 0,
            status: TransferStatus::Active,
            hasher: blake3::Hasher::new(),
            last_activity: Instant::now(),
        });

        info!(transfer = %id, file = %record.id, "Download started");

        // Metadata goes onto the outbound queue before the first chunk
        // can, so the client always sees the announcement first.
        requester.send(WireMessage::FileDownloadResponse(FileDownloadResponse {
            transfer_id: id,
            file_id: record.id,
            file_name: record.file_name.clone(),
            total_size: record.size_bytes as u64,
            chunk_size: self.chunk_size,
            blake3_hex: record.blake3_hex.clone(),
            timestamp: unix_now(),
        }));

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.stream_download(arc, file).await;
        });

        Ok(id)
    }

    async fn stream_download(
        &self,
        arc: Arc<tokio::sync::Mutex<Transfer>>,
        mut file: tokio::fs::File,
    ) {
        let mut buf = vec![0u8; self.chunk_size as usize];

        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Blob read failed mid-download");
                    let mut transfer = arc.lock().await;
                    transfer.status = TransferStatus::Failed;
                    self.remove(transfer.id);
                    return;
                }
            };

            let mut transfer = arc.lock().await;
            if transfer.status != TransferStatus::Active {
                // Cancelled from the owning session.
                self.remove(transfer.id);
                return;
            }

            if n == 0 {
                transfer.status = TransferStatus::Complete;
                self.remove(transfer.id);
                debug!(transfer = %transfer.id, "Download complete");
                return;
            }

            let delivered = transfer.owner.send(WireMessage::FileChunk(FileChunk {
                transfer_id: transfer.id,
                seq: transfer.next_seq,
                data: buf[..n].to_vec(),
                timestamp: unix_now(),
            }));
            if !delivered {
                transfer.status = TransferStatus::Failed;
                self.remove(transfer.id);
                debug!(transfer = %transfer.id, "Recipient gone, download dropped");
                return;
            }

            transfer.bytes_transferred += n as u64;
            transfer.next_seq += 1;
            transfer.last_activity = Instant::now();
        }
    }

    /// Cancel one transfer at the owner's request.
    pub async fn cancel(
        &self,
        session_id: SessionId,
        transfer_id: TransferId,
    ) -> Result<(), ServerError> {
        let arc = self
            .lookup(transfer_id)
            .ok_or_else(|| ServerError::Transfer(format!("unknown transfer {transfer_id}")))?;

        let mut transfer = arc.lock().await;
        if transfer.session_id != session_id {
            return Err(ServerError::Transfer(
                "transfer belongs to another connection".into(),
            ));
        }
        self.abort(&mut transfer, TransferStatus::Cancelled).await;
        info!(transfer = %transfer_id, "Transfer cancelled");
        Ok(())
    }

    /// Cancel everything a closing session still had in flight.
    pub async fn cancel_for_session(&self, session_id: SessionId) {
        let arcs: Vec<_> = {
            let transfers = self.transfers.lock().expect("transfer map lock poisoned");
            transfers.values().cloned().collect()
        };

        for arc in arcs {
            let mut transfer = arc.lock().await;
            if transfer.session_id == session_id && transfer.status == TransferStatus::Active {
                self.abort(&mut transfer, TransferStatus::Cancelled).await;
                debug!(transfer = %transfer.id, "Cancelled with closing session");
            }
        }
    }

    /// Cancel transfers with no activity inside the idle window and tell
    /// their owners. The owning connections are untouched.
    pub async fn reap_idle(&self) {
        let arcs: Vec<_> = {
            let transfers = self.transfers.lock().expect("transfer map lock poisoned");
            transfers.values().cloned().collect()
        };

        for arc in arcs {
            let mut transfer = arc.lock().await;
            if transfer.status == TransferStatus::Active
                && transfer.last_activity.elapsed() > self.idle_timeout
            {
                warn!(
                    transfer = %transfer.id,
                    file = %transfer.file_name,
                    "Transfer idle too long, cancelling"
                );
                let notice = WireMessage::SystemMessage(SystemMessage {
                    group_id: Some(transfer.group_id),
                    content: format!(
                        "transfer of \"{}\" cancelled: no data received",
                        transfer.file_name
                    ),
                    timestamp: unix_now(),
                });
                transfer.owner.send(notice);
                self.abort(&mut transfer, TransferStatus::Cancelled).await;
            }
        }
    }

    /// Terminal-state a transfer, discard partial data, free the slot.
    async fn abort(&self, transfer: &mut Transfer, status: TransferStatus) {
        transfer.status = status;
        if transfer.direction == Direction::Upload {
            self.files.discard_staging(transfer.id).await;
        }
        self.remove(transfer.id);
    }
}
