use crate::bitfield::BitField;
use crate::files::FileSet;
use crate::metainfo::Metainfo;
use crate::peer::message::Message;
#[cfg_attr(not(test), allow(unused_imports))]
use crate::peer::session::{BitfieldUpdate, Peer, PeerEvent, MAX_PENDING_REQUESTS};
use crate::piece::{ChunkOutcome, Piece, PieceIndex};
use crate::tracker::announce::{
    transport_for_url, AnnounceData, AnnounceTransport, Tracker, TrackerContext, TrackerState,
    TransferTotals,
};
use crate::utils::generate_peer_id;
use anyhow::{bail, Context};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Torrent lifecycle status. `LoadError` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Loading,
    Ready,
    LoadError,
}

/// Events emitted to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    /// Load and initial verification finished.
    Ready,
    /// Every piece is verified present. Emitted at most once.
    Complete,
    /// A piece just completed; payload is the completed fraction.
    Progress(f64),
    /// A tracker announce resolved.
    Updated,
    /// Loading failed; see `last_error`.
    Error,
}

/// External happenings delivered to the coordinator mailbox. Collaborators
/// hold a `Sender<Event>` clone and never a reference to the torrent; every
/// handler runs on the thread draining the mailbox, so shared torrent state
/// is only ever touched from one logical execution context.
#[derive(Debug)]
pub enum Event {
    Peer(SocketAddr, PeerEvent),
    /// A downloaded chunk arrived from a peer.
    Chunk {
        from: SocketAddr,
        index: u32,
        begin: u32,
        data: Bytes,
    },
    /// A peer asked us for a chunk.
    ChunkRequest {
        from: SocketAddr,
        index: u32,
        begin: u32,
        length: u32,
    },
    /// An announce resolved (`data`) or failed (`None`).
    Tracker {
        slot: usize,
        data: Option<AnnounceData>,
    },
}

/// Observer snapshot of one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub choked: bool,
    pub requests: usize,
    pub download_rate: f64,
    pub upload_rate: f64,
}

/// Observer snapshot of one tracker.
#[derive(Debug, Clone)]
pub struct TrackerInfo {
    pub url: String,
    pub state: TrackerState,
    pub error: Option<String>,
}

/// The coordinator: owns the torrent's global state and wires tracker,
/// peer, piece and file events together under the integrity invariants.
pub struct Torrent {
    download_path: PathBuf,
    port: u16,
    peer_id: [u8; 20],

    status: Status,
    last_error: Option<anyhow::Error>,
    name: String,
    info_hash: [u8; 20],
    piece_length: u32,
    size: u64,

    files: Option<FileSet>,
    pieces: Option<PieceIndex>,
    /// bit set ⇔ piece verified present
    completed: BitField,
    /// bit set ⇔ piece assigned to at least one peer and not yet complete
    active: BitField,
    peers: HashMap<SocketAddr, Peer>,
    trackers: Vec<Tracker>,

    /// bytes acquired this session; excludes bytes already on disk at load
    downloaded: u64,
    uploaded: u64,
    seeders: u64,
    leechers: u64,
    totals: Arc<TransferTotals>,

    complete_emitted: bool,
    stopped: bool,
    rng: StdRng,

    mailbox_tx: Sender<Event>,
    mailbox_rx: Receiver<Event>,
    events_tx: Sender<TorrentEvent>,
    events_rx: Receiver<TorrentEvent>,
}

impl Torrent {
    pub fn new(download_path: PathBuf, port: u16) -> Torrent {
        let (mailbox_tx, mailbox_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        Torrent {
            download_path,
            port,
            peer_id: generate_peer_id(),
            status: Status::Loading,
            last_error: None,
            name: String::new(),
            info_hash: [0; 20],
            piece_length: 0,
            size: 0,
            files: None,
            pieces: None,
            completed: BitField::new(0),
            active: BitField::new(0),
            peers: HashMap::new(),
            trackers: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            seeders: 0,
            leechers: 0,
            totals: Arc::new(TransferTotals::default()),
            complete_emitted: false,
            stopped: false,
            rng: StdRng::from_entropy(),
            mailbox_tx,
            mailbox_rx,
            events_tx,
            events_rx,
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Loads a descriptor from disk. Failures land in `last_error` and emit
    /// `Error` rather than returning; the torrent never panics past its
    /// event boundary.
    pub fn load_file(&mut self, path: &Path) {
        match std::fs::read(path).with_context(|| format!("failed to read {}", path.display())) {
            Ok(bytes) => self.load_bytes(&bytes),
            Err(e) => self.fail_load(e),
        }
    }

    /// Parses the descriptor, opens the backing files and verifies what is
    /// already on disk, then transitions to Ready. One-shot: a torrent that
    /// already loaded (or failed) ignores further calls.
    pub fn load_bytes(&mut self, bytes: &[u8]) {
        if self.status != Status::Loading {
            return;
        }
        if let Err(e) = self.try_load(bytes) {
            self.fail_load(e);
        }
    }

    fn try_load(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let metainfo = Metainfo::from_bytes(bytes)?;
        let plan = metainfo.plan()?;
        let mut files = FileSet::create(&self.download_path, &plan.files)?;
        let mut pieces = PieceIndex::build(&plan.piece_hashes, plan.piece_length, plan.size, &files);
        let completed = pieces.scan(&mut files);

        self.name = plan.name;
        self.info_hash = plan.info_hash;
        self.piece_length = plan.piece_length;
        self.size = plan.size;
        self.active = BitField::new(pieces.len());
        self.trackers = plan
            .announce_urls
            .iter()
            .enumerate()
            .map(|(slot, url)| Tracker::new(url.clone(), slot))
            .collect();
        self.completed = completed;
        self.files = Some(files);
        self.pieces = Some(pieces);
        self.refresh_totals();
        self.status = Status::Ready;
        info!(
            "loaded {}: {} pieces, {} bytes, {} already present",
            self.name,
            self.completed.len(),
            self.size,
            self.completed.count()
        );

        // a torrent that loads whole announces complete before ready
        if self.completed.is_all_set() {
            self.complete_emitted = true;
            self.emit(TorrentEvent::Complete);
        }
        self.emit(TorrentEvent::Ready);
        Ok(())
    }

    fn fail_load(&mut self, e: anyhow::Error) {
        error!("load failed: {:#}", e);
        self.status = Status::LoadError;
        self.last_error = Some(e);
        self.emit(TorrentEvent::Error);
    }

    /// Starts the announce loop of every tracker.
    pub fn start(&mut self) {
        self.start_with(transport_for_url);
    }

    /// Like [`start`](Self::start) but with a caller-supplied transport
    /// factory, e.g. for alternate announce protocols.
    pub fn start_with<F>(&mut self, make_transport: F)
    where
        F: Fn(&str) -> anyhow::Result<Box<dyn AnnounceTransport>>,
    {
        if self.status != Status::Ready {
            return;
        }
        self.stopped = false;
        let ctx = TrackerContext {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            totals: self.totals.clone(),
        };
        for tracker in &mut self.trackers {
            match make_transport(tracker.url()) {
                Ok(transport) => tracker.start(ctx.clone(), self.mailbox_tx.clone(), transport),
                Err(e) => tracker.fail(format!("{:#}", e)),
            }
        }
    }

    /// Stops announcing and drops every peer. In-flight I/O finishes
    /// naturally; no peer is admitted afterwards until `start` runs again.
    pub fn stop(&mut self) {
        if self.status != Status::Ready {
            return;
        }
        info!("stopping {}", self.name);
        self.stopped = true;
        for tracker in &mut self.trackers {
            tracker.stop();
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.remove_peer(addr, "Torrent stopped.");
        }
    }

    // ---- mailbox ---------------------------------------------------------

    /// A sender for collaborators (wire sessions, announce workers) to
    /// deliver events into the coordinator.
    pub fn mailbox(&self) -> Sender<Event> {
        self.mailbox_tx.clone()
    }

    /// The host-facing event stream.
    pub fn subscribe(&self) -> Receiver<TorrentEvent> {
        self.events_rx.clone()
    }

    /// Processes one queued event; returns false on timeout.
    pub fn step(&mut self, timeout: Duration) -> bool {
        match self.mailbox_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Runs one coordinator handler. All torrent state mutation happens
    /// here, on the caller's thread.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Peer(addr, peer_event) => self.on_peer_event(addr, peer_event),
            Event::Chunk {
                from,
                index,
                begin,
                data,
            } => self.on_chunk(from, index, begin, &data),
            Event::ChunkRequest {
                from,
                index,
                begin,
                length,
            } => self.on_chunk_request(from, index, begin, length),
            Event::Tracker { slot, data } => self.on_tracker_update(slot, data),
        }
        debug_assert_eq!((&self.completed & &self.active).count(), 0);
    }

    // ---- peers -----------------------------------------------------------

    /// Admits a peer, keyed by address. Idempotent: a known peer is left
    /// untouched and false is returned. The wire session drains the peer's
    /// outbox (see [`peer_wire`](Self::peer_wire)) and reports lifecycle
    /// events through the mailbox.
    pub fn add_peer(&mut self, addr: SocketAddr) -> bool {
        if self.status != Status::Ready || self.stopped {
            return false;
        }
        if self.peers.contains_key(&addr) {
            debug!("peer {} already admitted", addr);
            return false;
        }
        info!("admitting peer {}", addr);
        self.peers.insert(addr, Peer::new(addr, self.completed.len()));
        true
    }

    /// The outbox receiver a wire session drains for a given peer.
    pub fn peer_wire(&self, addr: &SocketAddr) -> Option<Receiver<Message>> {
        self.peers.get(addr).map(|p| p.wire())
    }

    fn on_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        match event {
            PeerEvent::Connect => {
                let bitfield = self.completed.to_bytes();
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.mark_connected();
                    peer.send(Message::Bitfield(bitfield));
                }
            }
            PeerEvent::Disconnect => self.remove_peer(addr, "connection closed"),
            PeerEvent::Choked(choked) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.set_choked(choked);
                }
            }
            PeerEvent::Updated(update) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if let Err(e) = peer.apply_update(&update) {
                        warn!("peer {}: bad bitfield update: {}", addr, e);
                        return;
                    }
                    // interested ⇔ they have something we lack; re-derived on
                    // every update, oscillation is fine
                    let interested = peer.bitfield().difference(&self.completed).count() > 0;
                    peer.set_am_interested(interested);
                }
            }
            PeerEvent::Ready => self.on_peer_ready(addr),
        }
    }

    /// Drops a peer and returns every piece it was serving to the
    /// requestable pool.
    fn remove_peer(&mut self, addr: SocketAddr, reason: &str) {
        let Some(mut peer) = self.peers.remove(&addr) else {
            return;
        };
        peer.disconnect(reason);
        for index in peer.take_pieces_in_progress() {
            self.active.unset(index as usize);
            if let Some(pieces) = self.pieces.as_mut() {
                if let Some(piece) = pieces.get_mut(index as usize) {
                    piece.release();
                }
            }
        }
    }

    /// Piece selection on peer capacity: first reuse an active piece with
    /// chunks left to request, otherwise activate a uniformly random piece
    /// from what the peer has and nobody holds or serves, otherwise let the
    /// peer go idle.
    fn on_peer_ready(&mut self, addr: SocketAddr) {
        if self.status != Status::Ready || self.is_complete() {
            return;
        }
        let Some(pieces) = self.pieces.as_mut() else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if peer.is_choked() {
            return;
        }

        for index in self.active.set_indices() {
            if !peer.has_piece(index) {
                continue;
            }
            if let Some(piece) = pieces.get_mut(index) {
                if !piece.has_requested_all_chunks() {
                    Self::assign(peer, piece);
                    return;
                }
            }
        }

        let held = &self.active | &self.completed;
        let candidates = peer.bitfield().difference(&held).set_indices();
        if !candidates.is_empty() {
            let index = candidates[self.rng.gen_range(0..candidates.len())];
            self.active.set(index);
            if let Some(piece) = pieces.get_mut(index) {
                Self::assign(peer, piece);
            }
            return;
        }

        if peer.num_requests() == 0 {
            peer.set_am_interested(false);
        }
    }

    /// Points a peer at a piece and fills its request pipeline.
    fn assign(peer: &mut Peer, piece: &mut Piece) {
        peer.begin_piece(piece.index());
        while peer.num_requests() < MAX_PENDING_REQUESTS {
            match piece.next_request() {
                Some((begin, length)) => {
                    peer.send(Message::Request(piece.index(), begin, length));
                    peer.add_request();
                }
                None => break,
            }
        }
    }

    // ---- pieces ----------------------------------------------------------

    fn on_chunk(&mut self, from: SocketAddr, index: u32, begin: u32, data: &Bytes) {
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.complete_request();
            peer.record_download(data.len() as u64);
        }
        if self.completed.is_set(index as usize) {
            debug!("chunk for already-complete piece {}", index);
            return;
        }
        let (Some(files), Some(pieces)) = (self.files.as_mut(), self.pieces.as_mut()) else {
            return;
        };
        let Some(piece) = pieces.get_mut(index as usize) else {
            debug!("chunk for unknown piece {}", index);
            return;
        };
        match piece.receive_chunk(begin, data, files) {
            Ok(ChunkOutcome::Verified) => self.finish_piece(index),
            Ok(ChunkOutcome::Corrupt) => self.abandon_piece(index),
            Ok(ChunkOutcome::InProgress) | Ok(ChunkOutcome::Ignored) => {}
            Err(e) => {
                error!("piece {}: failed to persist: {}", index, e);
                self.abandon_piece(index);
            }
        }
    }

    /// A piece verified and persisted: account for it, tell every
    /// initialised peer, and emit progress (and completion, exactly once).
    fn finish_piece(&mut self, index: u32) {
        self.completed.set(index as usize);
        self.active.unset(index as usize);
        let length = self
            .pieces
            .as_ref()
            .and_then(|p| p.get(index as usize))
            .map(|p| p.length() as u64)
            .unwrap_or(0);
        self.downloaded += length;
        self.refresh_totals();
        info!(
            "piece {} complete ({}/{})",
            index,
            self.completed.count(),
            self.completed.len()
        );

        for peer in self.peers.values_mut() {
            peer.finish_piece(index);
            if peer.initialised() {
                peer.send(Message::Have(index));
            }
        }

        self.emit(TorrentEvent::Progress(self.progress()));
        if self.completed.is_all_set() && !self.complete_emitted {
            self.complete_emitted = true;
            info!("download complete: {}", self.name);
            for tracker in &self.trackers {
                tracker.notify_completed();
            }
            self.emit(TorrentEvent::Complete);
        }
    }

    /// A piece failed verification (or could not be persisted): free it for
    /// someone else. No event; the bitfields tell the story.
    fn abandon_piece(&mut self, index: u32) {
        self.active.unset(index as usize);
        for peer in self.peers.values_mut() {
            peer.finish_piece(index);
        }
    }

    // ---- chunk upload ----------------------------------------------------

    fn on_chunk_request(&mut self, from: SocketAddr, index: u32, begin: u32, length: u32) {
        match self.request_chunk(index, begin, length) {
            Ok(Some(data)) => {
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.record_upload(data.len() as u64);
                    peer.send(Message::Piece(index, begin, data));
                }
            }
            Ok(None) => debug!("peer {} requested unknown piece {}", from, index),
            Err(e) => warn!("chunk read for {} failed: {:#}", from, e),
        }
    }

    /// Serves a chunk from disk. Unknown piece ⇒ `Ok(None)`; a read error is
    /// returned for the peer component to act on. Rate limiting is not this
    /// layer's concern.
    pub fn request_chunk(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> anyhow::Result<Option<Bytes>> {
        let (Some(files), Some(pieces)) = (self.files.as_mut(), self.pieces.as_ref()) else {
            return Ok(None);
        };
        let Some(piece) = pieces.get(index as usize) else {
            return Ok(None);
        };
        if begin
            .checked_add(length)
            .map_or(true, |end| end > piece.length())
        {
            bail!(
                "chunk {}+{} outside piece {} of {} bytes",
                begin,
                length,
                index,
                piece.length()
            );
        }
        let data = files
            .read(piece.offset() + begin as u64, length as u64)
            .with_context(|| format!("failed to read piece {}", index))?;
        self.uploaded += data.len() as u64;
        self.totals.uploaded.store(self.uploaded, Ordering::Relaxed);
        Ok(Some(Bytes::from(data)))
    }

    // ---- trackers --------------------------------------------------------

    /// Folds an announce outcome into the swarm aggregates and admits any
    /// new peer candidates while the download is incomplete. A failed
    /// announce (`None`) leaves the aggregates alone.
    fn on_tracker_update(&mut self, slot: usize, data: Option<AnnounceData>) {
        if let Some(data) = data {
            if let Some(tracker) = self.trackers.get_mut(slot) {
                let (old_seeders, old_leechers) = tracker.contribution();
                self.seeders = self.seeders - old_seeders + data.seeders;
                self.leechers = self.leechers - old_leechers + data.leechers;
                tracker.set_contribution(data.seeders, data.leechers);
            }
            if !self.is_complete() && !self.stopped {
                for addr in data.peers {
                    self.add_peer(addr);
                }
            }
        }
        self.emit(TorrentEvent::Updated);
    }

    // ---- accounting ------------------------------------------------------

    fn refresh_totals(&mut self) {
        let have: u64 = match &self.pieces {
            Some(pieces) => self
                .completed
                .set_indices()
                .into_iter()
                .filter_map(|i| pieces.get(i))
                .map(|p| p.length() as u64)
                .sum(),
            None => 0,
        };
        self.totals.downloaded.store(self.downloaded, Ordering::Relaxed);
        self.totals.uploaded.store(self.uploaded, Ordering::Relaxed);
        self.totals.left.store(self.size - have, Ordering::Relaxed);
    }

    fn emit(&self, event: TorrentEvent) {
        let _ = self.events_tx.send(event);
    }

    // ---- observers -------------------------------------------------------

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_error(&self) -> Option<&anyhow::Error> {
        self.last_error.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.completed.len()
    }

    pub fn completed(&self) -> &BitField {
        &self.completed
    }

    pub fn active(&self) -> &BitField {
        &self.active
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn seeders(&self) -> u64 {
        self.seeders
    }

    pub fn leechers(&self) -> u64 {
        self.leechers
    }

    /// Payload bytes not yet verified present, as reported to trackers.
    pub fn left(&self) -> u64 {
        self.totals.left.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        !self.completed.is_empty() && self.completed.is_all_set()
    }

    pub fn progress(&self) -> f64 {
        if self.completed.is_empty() {
            0.0
        } else {
            self.completed.count() as f64 / self.completed.len() as f64
        }
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .map(|peer| PeerInfo {
                address: peer.addr(),
                choked: peer.is_choked(),
                requests: peer.num_requests(),
                download_rate: peer.download_rate(),
                upload_rate: peer.upload_rate(),
            })
            .collect()
    }

    pub fn list_trackers(&self) -> Vec<TrackerInfo> {
        self.trackers
            .iter()
            .map(|tracker| TrackerInfo {
                url: tracker.url().to_string(),
                state: tracker.state(),
                error: tracker.error_message(),
            })
            .collect()
    }

    pub fn calculate_download_rate(&self) -> f64 {
        self.peers.values().map(|p| p.download_rate()).sum()
    }

    pub fn calculate_upload_rate(&self) -> f64 {
        self.peers.values().map(|p| p.upload_rate()).sum()
    }
}
