use crate::tracker::announce::{AnnounceData, AnnounceEvent, AnnounceTransport, TrackerRequest};
use anyhow::{anyhow, bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::{Cursor, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;
use url::Url;

/// magic constant for the UDP tracker protocol, see BEP 15
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const ATTEMPTS: u32 = 5;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP announce per BEP 15: connect for a connection id, then announce,
/// both with transaction-id checks and a bounded number of resends.
pub struct UdpTransport;

fn event_code(event: Option<AnnounceEvent>) -> u32 {
    match event {
        None => 0,
        Some(AnnounceEvent::Completed) => 1,
        Some(AnnounceEvent::Started) => 2,
        Some(AnnounceEvent::Stopped) => 3,
    }
}

fn encode_connect(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    let _ = buf.write_u64::<BigEndian>(PROTOCOL_ID);
    let _ = buf.write_u32::<BigEndian>(ACTION_CONNECT);
    let _ = buf.write_u32::<BigEndian>(transaction_id);
    buf
}

fn parse_connect(raw: &[u8], transaction_id: u32) -> Result<u64> {
    if raw.len() < 16 {
        bail!("connect response is {} bytes, want 16", raw.len());
    }
    let mut cursor = Cursor::new(raw);
    let action = cursor.read_u32::<BigEndian>()?;
    let txn = cursor.read_u32::<BigEndian>()?;
    if txn != transaction_id {
        bail!("transaction id mismatch");
    }
    if action != ACTION_CONNECT {
        bail!("unexpected action {} in connect response", action);
    }
    Ok(cursor.read_u64::<BigEndian>()?)
}

fn encode_announce(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &TrackerRequest,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    let _ = buf.write_u64::<BigEndian>(connection_id);
    let _ = buf.write_u32::<BigEndian>(ACTION_ANNOUNCE);
    let _ = buf.write_u32::<BigEndian>(transaction_id);
    buf.extend_from_slice(&request.info_hash);
    buf.extend_from_slice(&request.peer_id);
    let _ = buf.write_u64::<BigEndian>(request.downloaded);
    let _ = buf.write_u64::<BigEndian>(request.left);
    let _ = buf.write_u64::<BigEndian>(request.uploaded);
    let _ = buf.write_u32::<BigEndian>(event_code(request.event));
    let _ = buf.write_u32::<BigEndian>(0); // ip: tracker uses the sender
    let _ = buf.write_u32::<BigEndian>(key);
    let _ = buf.write_i32::<BigEndian>(-1); // num_want: default
    let _ = buf.write_u16::<BigEndian>(request.port);
    buf
}

fn parse_announce(raw: &[u8], transaction_id: u32) -> Result<AnnounceData> {
    if raw.len() < 8 {
        bail!("announce response is {} bytes", raw.len());
    }
    let mut cursor = Cursor::new(raw);
    let action = cursor.read_u32::<BigEndian>()?;
    let txn = cursor.read_u32::<BigEndian>()?;
    if txn != transaction_id {
        bail!("transaction id mismatch");
    }
    if action == ACTION_ERROR {
        let mut message = Vec::new();
        cursor.read_to_end(&mut message)?;
        bail!("tracker error: {}", String::from_utf8_lossy(&message));
    }
    if action != ACTION_ANNOUNCE {
        bail!("unexpected action {} in announce response", action);
    }
    if raw.len() < 20 {
        bail!("announce response is {} bytes, want at least 20", raw.len());
    }
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;
    let mut peers = Vec::new();
    let mut entry = [0u8; 6];
    while cursor.read_exact(&mut entry).is_ok() {
        let addr = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        peers.push(SocketAddr::V4(SocketAddrV4::new(addr, port)));
    }
    Ok(AnnounceData {
        interval: Some(interval as u64),
        seeders: seeders as u64,
        leechers: leechers as u64,
        peers,
    })
}

/// Sends `packet` and waits for a datagram, resending on timeout up to
/// [`ATTEMPTS`] times.
fn exchange(
    socket: &mut UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
    packet: &[u8],
) -> Result<Vec<u8>> {
    for attempt in 0..ATTEMPTS {
        socket.send_to(packet, addr)?;
        poll.poll(events, Some(RESPONSE_TIMEOUT))?;
        if events.is_empty() {
            debug!("udp tracker silent, attempt {}/{}", attempt + 1, ATTEMPTS);
            continue;
        }
        let mut buf = [0u8; 1500];
        match socket.recv_from(&mut buf) {
            Ok((len, from)) if from == addr => return Ok(buf[..len].to_vec()),
            Ok((_, from)) => debug!("dropping datagram from unexpected {}", from),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
    }
    bail!("no response after {} attempts", ATTEMPTS)
}

impl AnnounceTransport for UdpTransport {
    fn announce(&mut self, url: &str, request: &TrackerRequest) -> Result<AnnounceData> {
        let parsed = Url::parse(url).with_context(|| format!("bad announce url {}", url))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("announce url {} has no host", url))?;
        let port = parsed
            .port()
            .ok_or_else(|| anyhow!("udp announce url {} has no port", url))?;
        let addr = format!("{}:{}", host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", host))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| anyhow!("no ipv4 address for {}", host))?;

        let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        poll.registry()
            .register(&mut socket, Token(0), Interest::READABLE)?;

        let mut rng = rand::thread_rng();

        let txn = rng.gen::<u32>();
        let raw = exchange(&mut socket, &mut poll, &mut events, addr, &encode_connect(txn))?;
        let connection_id = parse_connect(&raw, txn)?;

        let txn = rng.gen::<u32>();
        let key = rng.gen::<u32>();
        let packet = encode_announce(connection_id, txn, key, request);
        let raw = exchange(&mut socket, &mut poll, &mut events, addr, &packet)?;
        parse_announce(&raw, txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TrackerRequest {
        TrackerRequest {
            info_hash: [0xaa; 20],
            peer_id: [0xbb; 20],
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Some(AnnounceEvent::Started),
        }
    }

    #[test]
    fn test_connect_packet_layout() {
        let packet = encode_connect(0xdead_beef);
        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..], &0xdead_beefu32.to_be_bytes());
    }

    #[test]
    fn test_parse_connect_checks_transaction() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(&99u64.to_be_bytes());
        assert_eq!(parse_connect(&raw, 7).unwrap(), 99);
        assert!(parse_connect(&raw, 8).is_err());
        assert!(parse_connect(&raw[..10], 7).is_err());
    }

    #[test]
    fn test_announce_packet_is_98_bytes() {
        let packet = encode_announce(42, 7, 5, &request());
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[..8], &42u64.to_be_bytes());
        assert_eq!(&packet[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        // event code 2 = started
        assert_eq!(&packet[80..84], &2u32.to_be_bytes());
        assert_eq!(&packet[96..], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_parse_announce_with_peers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(&1800u32.to_be_bytes());
        raw.extend_from_slice(&2u32.to_be_bytes());
        raw.extend_from_slice(&5u32.to_be_bytes());
        raw.extend_from_slice(&[10, 0, 0, 9, 0x1a, 0xe1]);
        let data = parse_announce(&raw, 7).unwrap();
        assert_eq!(data.interval, Some(1800));
        assert_eq!(data.leechers, 2);
        assert_eq!(data.seeders, 5);
        assert_eq!(data.peers, vec!["10.0.0.9:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_announce_surfaces_tracker_error() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(b"torrent not registered");
        let err = parse_announce(&raw, 7).unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
    }
}
