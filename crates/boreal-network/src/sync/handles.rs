//! Per-peer stream handles for the sync sub-protocol. A handle owns one
//! byte stream and a request counter; requests are serialized per peer,
//! and responses are matched back by id. The shared map resolves the
//! create/fail race: a handle that fails to open either adopts the
//! replacement another task installed or removes its own dead entry.

use futures::future::BoxFuture;
use futures::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::error::{NetworkError, NetworkResult};

use super::codec::{read_varint_frame, write_varint_frame};
use super::messages::{SyncFrame, SyncRequest, SyncResponse};

/// Opens a fresh sync stream to a peer. Implemented by the overlay layer;
/// tests plug in-memory duplexes in.
pub trait StreamOpener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn open(&self, peer: PeerId) -> BoxFuture<'static, NetworkResult<Self::Stream>>;
}

/// One peer's open sync stream plus its request counter.
pub struct PeerHandle<S> {
    peer: PeerId,
    stream: S,
    next_request_id: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PeerHandle<S> {
    pub fn new(peer: PeerId, stream: S) -> Self {
        Self { peer, stream, next_request_id: 0 }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Sends one request and reads its response. `&mut self` keeps at
    /// most one request in flight per handle.
    pub async fn send_request(&mut self, request: SyncRequest) -> NetworkResult<SyncResponse> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        write_varint_frame(&mut self.stream, &SyncFrame { request_id, message: request }).await?;
        let frame: SyncFrame<SyncResponse> = read_varint_frame(&mut self.stream).await?;

        if frame.request_id != request_id {
            return Err(NetworkError::RequestIdMismatch {
                expected: request_id,
                got: frame.request_id,
            });
        }
        Ok(frame.message)
    }
}

struct HandleEntry<S> {
    /// Identity for invalidation: removing a stale handle must not evict
    /// a replacement installed behind our back.
    id: u64,
    handle: Arc<Mutex<PeerHandle<S>>>,
}

impl<S> Clone for HandleEntry<S> {
    fn clone(&self) -> Self {
        Self { id: self.id, handle: self.handle.clone() }
    }
}

/// Shared map of live handles for one sync service.
pub struct HandleMap<S> {
    entries: RwLock<HashMap<PeerId, HandleEntry<S>>>,
    next_entry_id: AtomicU64,
}

impl<S> Default for HandleMap<S> {
    fn default() -> Self {
        Self { entries: RwLock::new(HashMap::new()), next_entry_id: AtomicU64::new(0) }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> HandleMap<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up or creates the handle for `peer`. The stream opens
    /// outside the lock; if another task won the insert race we adopt
    /// its handle and drop ours, and if our open failed but a working
    /// handle appeared meanwhile we use that instead of surfacing the
    /// error.
    pub async fn handle_for_peer<O>(
        &self,
        opener: &O,
        peer: PeerId,
    ) -> NetworkResult<(u64, Arc<Mutex<PeerHandle<S>>>)>
    where
        O: StreamOpener<Stream = S>,
    {
        if let Some(entry) = self.lookup(&peer) {
            return Ok((entry.id, entry.handle));
        }

        match opener.open(peer).await {
            Ok(stream) => {
                let mut entries = self.entries.write().unwrap();
                if let Some(existing) = entries.get(&peer) {
                    // Raced: another task installed a handle first.
                    return Ok((existing.id, existing.handle.clone()));
                }
                let entry = HandleEntry {
                    id: self.next_entry_id.fetch_add(1, Ordering::Relaxed),
                    handle: Arc::new(Mutex::new(PeerHandle::new(peer, stream))),
                };
                entries.insert(peer, entry.clone());
                Ok((entry.id, entry.handle))
            }
            Err(err) => {
                if let Some(existing) = self.lookup(&peer) {
                    return Ok((existing.id, existing.handle));
                }
                Err(err)
            }
        }
    }

    fn lookup(&self, peer: &PeerId) -> Option<HandleEntry<S>> {
        self.entries.read().unwrap().get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.read().unwrap().contains_key(peer)
    }

    /// Removes a dead handle, but only if it is still the current entry.
    pub fn invalidate(&self, peer: &PeerId, entry_id: u64) {
        let mut entries = self.entries.write().unwrap();
        if entries.get(peer).map(|e| e.id) == Some(entry_id) {
            entries.remove(peer);
        }
    }

    /// Peers from `candidates` that have no live handle yet.
    pub fn without_handles(&self, candidates: &[PeerId]) -> Vec<PeerId> {
        let entries = self.entries.read().unwrap();
        candidates.iter().filter(|p| !entries.contains_key(p)).copied().collect()
    }

    /// Drops every handle; called at the end of a sync round.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

/// The request surface the sync round runs against. The production
/// implementation is [`StreamSyncClient`]; tests substitute canned peers.
pub trait SyncClient: Send + Sync {
    fn request(
        &self,
        peer: PeerId,
        request: SyncRequest,
    ) -> BoxFuture<'_, NetworkResult<SyncResponse>>;

    /// Round boundary: drop whatever per-peer state the client holds.
    fn end_round(&self) {}
}

/// Stream-backed sync client: lazy per-peer handles over an opener.
pub struct StreamSyncClient<O: StreamOpener> {
    opener: O,
    handles: HandleMap<O::Stream>,
}

impl<O: StreamOpener> StreamSyncClient<O> {
    pub fn new(opener: O) -> Self {
        Self { opener, handles: HandleMap::new() }
    }

    pub fn handles(&self) -> &HandleMap<O::Stream> {
        &self.handles
    }
}

impl<O: StreamOpener> SyncClient for StreamSyncClient<O> {
    fn request(
        &self,
        peer: PeerId,
        request: SyncRequest,
    ) -> BoxFuture<'_, NetworkResult<SyncResponse>> {
        Box::pin(async move {
            let (entry_id, handle) = self.handles.handle_for_peer(&self.opener, peer).await?;
            let mut guard = handle.lock().await;
            match guard.send_request(request).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    // Transient peer error: this handle is done for.
                    self.handles.invalidate(&peer, entry_id);
                    Err(err)
                }
            }
        })
    }

    fn end_round(&self) {
        self.handles.clear();
    }
}
