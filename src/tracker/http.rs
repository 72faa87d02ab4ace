use crate::tracker::announce::{AnnounceData, AnnounceEvent, AnnounceTransport, TrackerRequest};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};
use url::Url;
use urlencoding::encode_binary;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP announce: one GET per announce, `Connection: close`, bencoded body.
/// Peers are requested in compact form.
pub struct HttpTransport;

/// The query params that urlencode cleanly; the two binary ones are appended
/// by hand with percent-encoding.
#[derive(Debug, Serialize)]
struct QueryParams {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
}

fn event_name(event: Option<AnnounceEvent>) -> Option<&'static str> {
    match event {
        Some(AnnounceEvent::Started) => Some("started"),
        Some(AnnounceEvent::Stopped) => Some("stopped"),
        Some(AnnounceEvent::Completed) => Some("completed"),
        None => None,
    }
}

/// Builds the request path plus query string for the GET line.
fn build_announce_path(url: &Url, request: &TrackerRequest) -> Result<String> {
    let params = QueryParams {
        port: request.port,
        uploaded: request.uploaded,
        downloaded: request.downloaded,
        left: request.left,
        compact: 1,
        event: event_name(request.event),
    };
    let encoded = serde_urlencoded::to_string(&params).context("failed to encode query")?;
    Ok(format!(
        "{}?info_hash={}&peer_id={}&{}",
        url.path(),
        encode_binary(&request.info_hash),
        encode_binary(&request.peer_id),
        encoded
    ))
}

/// deserializes peers from the compact representation (6 bytes per peer)
mod peers {
    use serde::de::{self, Deserialize, Deserializer, Visitor};
    use std::fmt;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[derive(Debug, Clone)]
    pub struct Peers(pub Vec<SocketAddr>);

    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("compact representation of peers")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer list not a multiple of 6 bytes"));
            }
            let peers = v
                .chunks_exact(6)
                .map(|entry| {
                    let addr = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                    let port = u16::from_be_bytes([entry[4], entry[5]]);
                    SocketAddr::V4(SocketAddrV4::new(addr, port))
                })
                .collect();
            Ok(Peers(peers))
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(PeersVisitor)
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpAnnounceResponse {
    /// 200 OK can still carry a protocol-level failure
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    /// seeders
    #[serde(default)]
    complete: Option<u64>,
    /// leechers
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default)]
    peers: Option<peers::Peers>,
}

fn parse_announce_response(raw: &[u8]) -> Result<AnnounceData> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let body_start = match response.parse(raw).context("malformed http response")? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => bail!("truncated http response"),
    };
    let code = response.code.unwrap_or(0);
    if code != 200 {
        bail!("tracker returned http status {}", code);
    }

    let body: HttpAnnounceResponse =
        serde_bencode::from_bytes(&raw[body_start..]).context("malformed announce body")?;
    if let Some(reason) = body.failure_reason {
        bail!("tracker failure: {}", reason);
    }
    if let Some(warning) = body.warning_message {
        debug!("tracker warning: {}", warning);
    }
    Ok(AnnounceData {
        interval: body.interval,
        seeders: body.complete.unwrap_or(0),
        leechers: body.incomplete.unwrap_or(0),
        peers: body.peers.map(|p| p.0).unwrap_or_default(),
    })
}

impl AnnounceTransport for HttpTransport {
    fn announce(&mut self, url: &str, request: &TrackerRequest) -> Result<AnnounceData> {
        let parsed = Url::parse(url).with_context(|| format!("bad announce url {}", url))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("announce url {} has no host", url))?;
        let port = parsed.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", host))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", host))?;
        let get = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            build_announce_path(&parsed, request)?,
            host
        );

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        let mut stream = TcpStream::connect(addr)?;
        let token = Token(0);
        poll.registry()
            .register(&mut stream, token, Interest::WRITABLE)?;

        let deadline = Instant::now() + REQUEST_TIMEOUT;
        let mut raw = Vec::new();
        let mut sent = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                bail!("tracker request timed out");
            }
            poll.poll(&mut events, Some(deadline - now))?;
            if events.is_empty() {
                bail!("tracker request timed out");
            }
            for event in events.iter() {
                if event.token() != token {
                    continue;
                }
                if event.is_writable() && !sent {
                    stream.write_all(get.as_bytes())?;
                    sent = true;
                    poll.registry()
                        .reregister(&mut stream, token, Interest::READABLE)?;
                }
                if event.is_readable() {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) => return parse_announce_response(&raw),
                            Ok(n) => raw.extend_from_slice(&buf[..n]),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
    }
}
