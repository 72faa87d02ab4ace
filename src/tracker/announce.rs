use crate::torrent::Event;
use anyhow::{bail, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Interval between announces when the tracker does not dictate one.
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(120);
const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

/// Parameters of one announce, snapshotted from the shared totals.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

/// A successful announce response, reduced to what the coordinator consumes.
#[derive(Debug, Clone, Default)]
pub struct AnnounceData {
    pub interval: Option<u64>,
    pub seeders: u64,
    pub leechers: u64,
    pub peers: Vec<SocketAddr>,
}

/// One announce round trip. Implementations live in `tracker::http` and
/// `tracker::udp`; tests substitute their own.
pub trait AnnounceTransport: Send {
    fn announce(&mut self, url: &str, request: &TrackerRequest) -> Result<AnnounceData>;
}

/// Picks a transport by announce URL scheme.
pub fn transport_for_url(url: &str) -> Result<Box<dyn AnnounceTransport>> {
    let parsed = url::Url::parse(url)?;
    match parsed.scheme() {
        "http" => Ok(Box::new(crate::tracker::http::HttpTransport)),
        "udp" => Ok(Box::new(crate::tracker::udp::UdpTransport)),
        scheme => bail!("unsupported announce scheme {}", scheme),
    }
}

/// Byte totals shared between the coordinator (writer) and announce workers
/// (readers). `left` counts payload bytes not yet verified present.
#[derive(Debug, Default)]
pub struct TransferTotals {
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    pub left: AtomicU64,
}

/// Everything an announce worker needs to build requests; deliberately not a
/// reference to the torrent.
#[derive(Clone)]
pub struct TrackerContext {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub totals: Arc<TransferTotals>,
}

impl TrackerContext {
    fn request(&self, event: Option<AnnounceEvent>) -> TrackerRequest {
        TrackerRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: self.totals.uploaded.load(Ordering::Relaxed),
            downloaded: self.totals.downloaded.load(Ordering::Relaxed),
            left: self.totals.left.load(Ordering::Relaxed),
            event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Stopped,
    Announcing,
    Waiting,
    Error,
}

enum TrackerCommand {
    Completed,
    Stop,
}

struct Shared {
    state: Mutex<TrackerState>,
    error_message: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, state: TrackerState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_error(&self, message: Option<String>) {
        *self.error_message.lock().unwrap() = message;
    }
}

/// One tracker of the announce set: a state machine driven by a worker
/// thread that loops announce → wait, delivering each outcome to the
/// coordinator mailbox as `Event::Tracker`. Failures back off with doubling
/// delays instead of poll-spamming.
pub struct Tracker {
    url: String,
    slot: usize,
    shared: Arc<Shared>,
    commands: Option<Sender<TrackerCommand>>,
    worker: Option<JoinHandle<()>>,
    seeders: u64,
    leechers: u64,
}

impl Tracker {
    pub fn new(url: String, slot: usize) -> Tracker {
        Tracker {
            url,
            slot,
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState::Stopped),
                error_message: Mutex::new(None),
            }),
            commands: None,
            worker: None,
            seeders: 0,
            leechers: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> TrackerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.error_message.lock().unwrap().clone()
    }

    /// Last contribution to the torrent's swarm aggregates.
    pub fn contribution(&self) -> (u64, u64) {
        (self.seeders, self.leechers)
    }

    pub fn set_contribution(&mut self, seeders: u64, leechers: u64) {
        self.seeders = seeders;
        self.leechers = leechers;
    }

    /// Marks the tracker failed without a worker, e.g. for an unsupported
    /// announce URL scheme.
    pub fn fail(&mut self, message: String) {
        warn!("tracker {}: {}", self.url, message);
        self.shared.set_state(TrackerState::Error);
        self.shared.set_error(Some(message));
    }

    /// Begins the announce loop. A second call while running is a no-op.
    pub fn start(
        &mut self,
        ctx: TrackerContext,
        events: Sender<Event>,
        transport: Box<dyn AnnounceTransport>,
    ) {
        if self.commands.is_some() {
            return;
        }
        let (tx, rx) = unbounded();
        self.commands = Some(tx);
        let url = self.url.clone();
        let slot = self.slot;
        let shared = self.shared.clone();
        self.worker = Some(std::thread::spawn(move || {
            announce_loop(url, slot, shared, ctx, events, rx, transport);
        }));
    }

    /// Tells the worker to fire the `completed` announce event.
    pub fn notify_completed(&self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(TrackerCommand::Completed);
        }
    }

    /// Requests the terminal `stopped` announce. The worker finishes on its
    /// own; `stop` does not block the coordinator.
    pub fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(TrackerCommand::Stop);
        }
    }

    /// Waits for the worker to wind down. Used by shutdown paths that want
    /// the terminal announce on the wire before exiting.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn announce_loop(
    url: String,
    slot: usize,
    shared: Arc<Shared>,
    ctx: TrackerContext,
    events: Sender<Event>,
    commands: Receiver<TrackerCommand>,
    mut transport: Box<dyn AnnounceTransport>,
) {
    let mut event = Some(AnnounceEvent::Started);
    let mut backoff = INITIAL_BACKOFF;
    loop {
        shared.set_state(TrackerState::Announcing);
        let request = ctx.request(event);
        event = None;
        let wait = match transport.announce(&url, &request) {
            Ok(data) => {
                debug!(
                    "tracker {}: {} seeders / {} leechers / {} peers",
                    url,
                    data.seeders,
                    data.leechers,
                    data.peers.len()
                );
                shared.set_state(TrackerState::Waiting);
                shared.set_error(None);
                backoff = INITIAL_BACKOFF;
                let wait = data
                    .interval
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);
                if events.send(Event::Tracker { slot, data: Some(data) }).is_err() {
                    break;
                }
                wait
            }
            Err(e) => {
                warn!("tracker {}: announce failed: {:#}", url, e);
                shared.set_state(TrackerState::Error);
                shared.set_error(Some(format!("{:#}", e)));
                if events.send(Event::Tracker { slot, data: None }).is_err() {
                    break;
                }
                let wait = backoff;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                wait
            }
        };

        match commands.recv_timeout(wait) {
            Ok(TrackerCommand::Completed) => event = Some(AnnounceEvent::Completed),
            Ok(TrackerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    let request = ctx.request(Some(AnnounceEvent::Stopped));
    if let Err(e) = transport.announce(&url, &request) {
        debug!("tracker {}: stopped announce failed: {:#}", url, e);
    }
    shared.set_state(TrackerState::Stopped);
    info!("tracker {} stopped", url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    struct ScriptedTransport {
        log: Arc<Mutex<Vec<TrackerRequest>>>,
        fail: bool,
    }

    impl AnnounceTransport for ScriptedTransport {
        fn announce(&mut self, _url: &str, request: &TrackerRequest) -> Result<AnnounceData> {
            self.log.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(anyhow!("connection refused"));
            }
            Ok(AnnounceData {
                interval: None,
                seeders: 5,
                leechers: 2,
                peers: vec!["10.0.0.9:6881".parse().unwrap()],
            })
        }
    }

    fn context() -> TrackerContext {
        let totals = Arc::new(TransferTotals::default());
        totals.left.store(100, Ordering::Relaxed);
        TrackerContext {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            totals,
        }
    }

    #[test]
    fn test_announce_delivers_data_and_lifecycle_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded();
        let mut tracker = Tracker::new("http://t/announce".to_string(), 0);
        tracker.start(
            context(),
            tx,
            Box::new(ScriptedTransport {
                log: log.clone(),
                fail: false,
            }),
        );

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Event::Tracker { slot, data } => {
                assert_eq!(slot, 0);
                let data = data.unwrap();
                assert_eq!(data.seeders, 5);
                assert_eq!(data.leechers, 2);
                assert_eq!(data.peers.len(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(tracker.state(), TrackerState::Waiting);

        tracker.notify_completed();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Event::Tracker { data, .. } => assert!(data.is_some()),
            other => panic!("unexpected event {:?}", other),
        }

        tracker.stop();
        tracker.join();
        assert_eq!(tracker.state(), TrackerState::Stopped);

        let requests = log.lock().unwrap();
        assert_eq!(requests[0].event, Some(AnnounceEvent::Started));
        assert_eq!(requests[0].left, 100);
        assert_eq!(requests[1].event, Some(AnnounceEvent::Completed));
        assert_eq!(requests.last().unwrap().event, Some(AnnounceEvent::Stopped));
    }

    #[test]
    fn test_failed_announce_reports_error_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded();
        let mut tracker = Tracker::new("http://t/announce".to_string(), 3);
        tracker.start(
            context(),
            tx,
            Box::new(ScriptedTransport {
                log,
                fail: true,
            }),
        );

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Event::Tracker { slot, data } => {
                assert_eq!(slot, 3);
                assert!(data.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(tracker.state(), TrackerState::Error);
        assert!(tracker
            .error_message()
            .unwrap()
            .contains("connection refused"));
        tracker.stop();
        tracker.join();
    }

    #[test]
    fn test_fail_marks_error_without_worker() {
        let mut tracker = Tracker::new("wss://t/announce".to_string(), 0);
        tracker.fail("unsupported scheme".to_string());
        assert_eq!(tracker.state(), TrackerState::Error);
        assert_eq!(
            tracker.error_message().as_deref(),
            Some("unsupported scheme")
        );
    }
}
