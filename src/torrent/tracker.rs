// Tracker announces: HTTP (BEP 3, BEP 23 compact peers) and UDP (BEP 15).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use serde::Deserialize;
use serde_bencode::value::Value;
use thiserror::Error;
use tokio::net::UdpSocket;
use url::Url;

use crate::config::{ADVERTISED_PEER_PORT, TRACKER_DEFAULT_INTERVAL_SECS, TRACKER_TIMEOUT_SECS};

const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;
const UDP_ACTION_CONNECT: u32 = 0;
const UDP_ACTION_ANNOUNCE: u32 = 1;
const UDP_ACTION_ERROR: u32 = 3;
const UDP_EVENT_STARTED: u32 = 2;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unsupported tracker url {0}")]
    Unsupported(String),

    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker timed out")]
    Timeout,

    #[error("tracker refused: {0}")]
    Failure(String),

    #[error("malformed tracker response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

pub struct TrackerClient {
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(TRACKER_TIMEOUT_SECS))
            .user_agent(concat!("ma-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    pub async fn announce(
        &self,
        tracker: &str,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = Url::parse(tracker).map_err(|_| TrackerError::Unsupported(tracker.into()))?;
        match url.scheme() {
            "http" | "https" => self.announce_http(tracker, req).await,
            "udp" => {
                let fut = announce_udp(&url, req);
                tokio::time::timeout(Duration::from_secs(TRACKER_TIMEOUT_SECS), fut)
                    .await
                    .map_err(|_| TrackerError::Timeout)?
            }
            _ => Err(TrackerError::Unsupported(tracker.into())),
        }
    }

    async fn announce_http(
        &self,
        tracker: &str,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = http_announce_url(tracker, req);
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_http_response(&body)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw 20-byte values are percent-encoded by hand; `Url` query helpers
/// would treat them as text.
pub fn http_announce_url(tracker: &str, req: &AnnounceRequest) -> String {
    let sep = if tracker.contains('?') { '&' } else { '?' };
    format!(
        "{tracker}{sep}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded={}&left={}&compact=1&event=started&numwant=80",
        percent_encode(&req.info_hash, NON_ALPHANUMERIC),
        percent_encode(&req.peer_id, NON_ALPHANUMERIC),
        ADVERTISED_PEER_PORT,
        req.downloaded,
        req.left,
    )
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Option<Value>,
    #[serde(default)]
    peers6: Option<Value>,
}

pub fn parse_http_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let resp: HttpResponse =
        serde_bencode::from_bytes(body).map_err(|e| TrackerError::Malformed(e.to_string()))?;
    if let Some(reason) = resp.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    let mut peers = Vec::new();
    match resp.peers {
        Some(Value::Bytes(compact)) => peers.extend(parse_compact_v4(&compact)),
        Some(Value::List(entries)) => peers.extend(entries.iter().filter_map(dict_peer)),
        _ => {}
    }
    if let Some(Value::Bytes(compact)) = resp.peers6 {
        peers.extend(parse_compact_v6(&compact));
    }

    Ok(AnnounceResponse {
        interval: Duration::from_secs(
            resp.interval
                .filter(|&i| i > 0)
                .unwrap_or(TRACKER_DEFAULT_INTERVAL_SECS),
        ),
        peers,
    })
}

fn dict_peer(entry: &Value) -> Option<SocketAddr> {
    let Value::Dict(dict) = entry else {
        return None;
    };
    let ip = match dict.get(b"ip".as_slice())? {
        Value::Bytes(raw) => std::str::from_utf8(raw).ok()?.parse().ok()?,
        _ => return None,
    };
    let port = match dict.get(b"port".as_slice())? {
        Value::Int(port) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

pub fn parse_compact_v4(raw: &[u8]) -> Vec<SocketAddr> {
    raw.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .filter(|a| a.port() != 0)
        .collect()
}

pub fn parse_compact_v6(raw: &[u8]) -> Vec<SocketAddr> {
    raw.chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .filter(|a| a.port() != 0)
        .collect()
}

async fn announce_udp(url: &Url, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::Unsupported(url.to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TrackerError::Unsupported(url.to_string()))?;
    let target = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TrackerError::Malformed(format!("{host} did not resolve")))?;

    let bind = if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;

    let mut buf = [0u8; 2048];

    let txid: u32 = rand::thread_rng().gen();
    let mut connect = Vec::with_capacity(16);
    connect.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    connect.extend_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
    connect.extend_from_slice(&txid.to_be_bytes());
    socket.send(&connect).await?;
    let n = socket.recv(&mut buf).await?;
    let reply = check_udp_reply(&buf[..n], txid, UDP_ACTION_CONNECT, 16)?;
    let connection_id = u64::from_be_bytes(
        reply[8..16]
            .try_into()
            .map_err(|_| TrackerError::Malformed("connection id".into()))?,
    );

    let txid: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();
    let mut announce = Vec::with_capacity(98);
    announce.extend_from_slice(&connection_id.to_be_bytes());
    announce.extend_from_slice(&UDP_ACTION_ANNOUNCE.to_be_bytes());
    announce.extend_from_slice(&txid.to_be_bytes());
    announce.extend_from_slice(&req.info_hash);
    announce.extend_from_slice(&req.peer_id);
    announce.extend_from_slice(&req.downloaded.to_be_bytes());
    announce.extend_from_slice(&req.left.to_be_bytes());
    announce.extend_from_slice(&0u64.to_be_bytes());
    announce.extend_from_slice(&UDP_EVENT_STARTED.to_be_bytes());
    announce.extend_from_slice(&0u32.to_be_bytes());
    announce.extend_from_slice(&key.to_be_bytes());
    announce.extend_from_slice(&(-1i32).to_be_bytes());
    announce.extend_from_slice(&ADVERTISED_PEER_PORT.to_be_bytes());
    socket.send(&announce).await?;
    let n = socket.recv(&mut buf).await?;
    let reply = check_udp_reply(&buf[..n], txid, UDP_ACTION_ANNOUNCE, 20)?;

    let interval = u32::from_be_bytes([reply[8], reply[9], reply[10], reply[11]]);
    let peers = if target.is_ipv4() {
        parse_compact_v4(&reply[20..])
    } else {
        parse_compact_v6(&reply[20..])
    };
    Ok(AnnounceResponse {
        interval: Duration::from_secs(if interval > 0 {
            interval as u64
        } else {
            TRACKER_DEFAULT_INTERVAL_SECS
        }),
        peers,
    })
}

fn check_udp_reply(
    reply: &[u8],
    txid: u32,
    action: u32,
    min_len: usize,
) -> Result<&[u8], TrackerError> {
    if reply.len() < 8 {
        return Err(TrackerError::Malformed("short udp reply".into()));
    }
    let got_action = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
    let got_txid = u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]]);
    if got_txid != txid {
        return Err(TrackerError::Malformed("transaction id mismatch".into()));
    }
    if got_action == UDP_ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(&reply[8..]).into_owned(),
        ));
    }
    if got_action != action || reply.len() < min_len {
        return Err(TrackerError::Malformed(format!(
            "unexpected udp reply (action {got_action}, {} bytes)",
            reply.len()
        )));
    }
    Ok(reply)
}
