use crate::bitfield::BitField;
use crate::peer::message::Message;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Outstanding chunk requests a single peer may hold.
pub const MAX_PENDING_REQUESTS: usize = 5;

const RATE_WINDOW: Duration = Duration::from_secs(2);

/// Peer lifecycle events, delivered to the coordinator mailbox by the wire
/// layer that owns the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Handshake completed; the session is live.
    Connect,
    /// The connection went away, cleanly or not.
    Disconnect,
    /// The remote choked (true) or unchoked (false) us.
    Choked(bool),
    /// The remote's bitfield mutated or was refreshed.
    Updated(BitfieldUpdate),
    /// The session has capacity for another piece assignment.
    Ready,
}

/// The bitfield mutation carried by [`PeerEvent::Updated`].
#[derive(Debug, Clone, PartialEq)]
pub enum BitfieldUpdate {
    /// A full BITFIELD message payload.
    Replace(Vec<u8>),
    /// A HAVE for one piece.
    Have(u32),
}

/// Simple windowed byte-rate gauge.
struct RateCounter {
    window: Instant,
    bytes: u64,
    rate: f64,
}

impl RateCounter {
    fn new() -> RateCounter {
        RateCounter {
            window: Instant::now(),
            bytes: 0,
            rate: 0.0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
        let elapsed = self.window.elapsed();
        if elapsed >= RATE_WINDOW {
            self.rate = self.bytes as f64 / elapsed.as_secs_f64();
            self.bytes = 0;
            self.window = Instant::now();
        }
    }

    fn rate(&self) -> f64 {
        self.rate
    }
}

/// A peer as the coordinator sees it: wire-layer state mirrored through
/// events, plus an outbox of messages for the wire layer to drain. The peer
/// never holds a reference back to the torrent.
pub struct Peer {
    addr: SocketAddr,
    bitfield: BitField,
    am_interested: bool,
    is_choked: bool,
    num_requests: usize,
    pieces_in_progress: Vec<u32>,
    initialised: bool,
    outbox: Sender<Message>,
    wire: Receiver<Message>,
    download: RateCounter,
    upload: RateCounter,
}

impl Peer {
    pub fn new(addr: SocketAddr, num_pieces: usize) -> Peer {
        let (outbox, wire) = unbounded();
        Peer {
            addr,
            bitfield: BitField::new(num_pieces),
            am_interested: false,
            is_choked: true,
            num_requests: 0,
            pieces_in_progress: Vec::new(),
            initialised: false,
            outbox,
            wire,
            download: RateCounter::new(),
            upload: RateCounter::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bitfield(&self) -> &BitField {
        &self.bitfield
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.is_set(index)
    }

    pub fn is_choked(&self) -> bool {
        self.is_choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.is_choked = choked;
    }

    pub fn initialised(&self) -> bool {
        self.initialised
    }

    pub fn mark_connected(&mut self) {
        self.initialised = true;
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    /// Updates our interest flag, telling the remote only on a change.
    pub fn set_am_interested(&mut self, interested: bool) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.send(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    pub fn num_requests(&self) -> usize {
        self.num_requests
    }

    pub fn add_request(&mut self) {
        self.num_requests += 1;
    }

    pub fn complete_request(&mut self) {
        self.num_requests = self.num_requests.saturating_sub(1);
    }

    pub fn pieces_in_progress(&self) -> &[u32] {
        &self.pieces_in_progress
    }

    pub fn begin_piece(&mut self, index: u32) {
        if !self.pieces_in_progress.contains(&index) {
            self.pieces_in_progress.push(index);
        }
    }

    pub fn finish_piece(&mut self, index: u32) {
        self.pieces_in_progress.retain(|&i| i != index);
    }

    pub fn take_pieces_in_progress(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pieces_in_progress)
    }

    /// Applies a bitfield mutation reported by the wire layer.
    pub fn apply_update(&mut self, update: &BitfieldUpdate) -> io::Result<()> {
        match update {
            BitfieldUpdate::Replace(payload) => {
                self.bitfield = BitField::from_bytes(payload, self.bitfield.len())?;
            }
            BitfieldUpdate::Have(index) => {
                if *index as usize >= self.bitfield.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("have for piece {} out of range", index),
                    ));
                }
                self.bitfield.set(*index as usize);
            }
        }
        Ok(())
    }

    /// Queues a message for the wire layer. A closed outbox means the
    /// session is already gone; the message is dropped.
    pub fn send(&mut self, message: Message) {
        trace!("queueing {} for {}", message.name(), self.addr);
        if self.outbox.send(message).is_err() {
            debug!("outbox for {} is closed", self.addr);
        }
    }

    /// The wire layer's end of the outbox.
    pub fn wire(&self) -> Receiver<Message> {
        self.wire.clone()
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.download.record(bytes);
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.upload.record(bytes);
    }

    pub fn download_rate(&self) -> f64 {
        self.download.rate()
    }

    pub fn upload_rate(&self) -> f64 {
        self.upload.rate()
    }

    pub fn disconnect(&mut self, reason: &str) {
        info!("disconnecting {}: {}", self.addr, reason);
    }
}
