//! # Tracker Client
//!
//! Peer discovery over plain HTTP: one GET to each announce URL with the
//! swarm parameters in the query string, answered by a bencoded dictionary
//! whose `peers` value is the compact peer list (6-byte records of IPv4
//! address and port).
//!
//! The `info_hash` and `peer_id` parameters are raw 20-byte strings and go
//! through byte-wise `%XX` percent-encoding — every byte, alphanumerics
//! included, which is the safest form across tracker implementations.
//!
//! All trackers from every tier are queried in parallel and the peer lists
//! merged and deduplicated; a single reachable tracker is enough.

use crate::bencode::{self, Value};
use crate::peer::{self, Peer};
use crate::torrent::Torrent;

use anyhow::{anyhow, Context, Result};
use url::Url;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// HTTP round-trip timeout per tracker
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// The optional `event` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    #[allow(dead_code)]
    Stopped,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// Query all of the torrent's trackers and merge their peer lists.
///
/// Tiers are flattened in order; every URL is tried in its own thread and
/// failures are skipped. Fails only when no tracker produced any peer.
pub fn request_peers(torrent: &Torrent, peer_id: &[u8; 20], port: u16) -> Result<Vec<Peer>> {
    let mut seen = HashSet::new();
    let urls: Vec<String> = torrent
        .tiers()
        .iter()
        .flatten()
        .filter(|url| seen.insert(url.to_string()))
        .cloned()
        .collect();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for announce in urls {
        let info_hash = torrent.info_hash();
        let peer_id = *peer_id;
        let left = torrent.total_length();
        let collected = Arc::clone(&collected);

        handles.push(thread::spawn(move || {
            match announce_once(&announce, &info_hash, &peer_id, port, left) {
                Ok(mut peers) => {
                    debug!("tracker {} returned {} peers", announce, peers.len());
                    collected.lock().unwrap().append(&mut peers);
                }
                Err(e) => debug!("tracker {} skipped: {:#}", announce, e),
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }

    // Merge, dropping duplicate endpoints across trackers.
    let mut seen = HashSet::new();
    let peers: Vec<Peer> = collected
        .lock()
        .unwrap()
        .iter()
        .copied()
        .filter(|peer| seen.insert((peer.ip, peer.port)))
        .collect();

    if peers.is_empty() {
        return Err(anyhow!("could not get peers from any tracker"));
    }
    Ok(peers)
}

/// Politeness call after a finished download; failures only get logged.
pub fn announce_completed(torrent: &Torrent, peer_id: &[u8; 20], port: u16) {
    for announce in torrent.tiers().iter().flatten() {
        let url = match build_announce_url(
            announce,
            &torrent.info_hash(),
            peer_id,
            port,
            0,
            torrent.total_length(),
            0,
            Some(AnnounceEvent::Completed),
        ) {
            Ok(url) => url,
            Err(e) => {
                debug!("tracker {} skipped: {:#}", announce, e);
                continue;
            }
        };
        let response = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .and_then(|client| client.get(&url).send());
        if let Err(e) = response {
            debug!("completed announce to {} failed: {}", announce, e);
        }
    }
}

fn announce_once(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    let url = build_announce_url(
        announce,
        info_hash,
        peer_id,
        port,
        0,
        0,
        left,
        Some(AnnounceEvent::Started),
    )?;

    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()
        .context("could not build http client")?;
    let body = client
        .get(&url)
        .send()
        .and_then(|response| response.bytes())
        .with_context(|| format!("tracker request to {} failed", announce))?;

    parse_tracker_response(&body)
}

/// Assemble the GET URL for one announce.
///
/// The query string is built by hand: `info_hash` and `peer_id` are binary
/// and standard form-encoders mangle them.
#[allow(clippy::too_many_arguments)]
pub fn build_announce_url(
    announce: &str,
    info_hash: &[u8],
    peer_id: &[u8],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    event: Option<AnnounceEvent>,
) -> Result<String> {
    // Validate before string surgery below.
    Url::parse(announce).map_err(|_| anyhow!("could not parse tracker url {:?}", announce))?;

    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode_bytes(info_hash),
        percent_encode_bytes(peer_id),
        port,
        uploaded,
        downloaded,
        left,
    );
    if let Some(event) = event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }

    let mut url = announce.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);
    Ok(url)
}

/// Encode every byte as `%XX`, uppercase hex.
fn percent_encode_bytes(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);
    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }
    encoded
}

/// Decode a tracker response body into its peer list.
///
/// The body must be a bencoded dictionary. A `failure reason` entry is
/// surfaced as the error. `peers` is normally the compact byte-string;
/// the non-compact dictionary-list form is accepted as well.
pub fn parse_tracker_response(body: &[u8]) -> Result<Vec<Peer>> {
    let value = bencode::decode(body).context("could not decode tracker response")?;
    if !matches!(value, Value::Dict(_)) {
        return Err(anyhow!("tracker response is not a dictionary"));
    }

    if let Some(reason) = value.get(b"failure reason").and_then(Value::as_bytes) {
        return Err(anyhow!(
            "tracker failure: {}",
            String::from_utf8_lossy(reason)
        ));
    }

    match value.get(b"peers") {
        Some(Value::Bytes(compact)) => peer::parse_compact_peers(compact),
        Some(Value::List(list)) => {
            let mut peers = Vec::with_capacity(list.len());
            for entry in list {
                let ip = entry
                    .get(b"ip")
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| anyhow!("tracker peer entry has no ip"))?;
                let ip: Ipv4Addr = String::from_utf8_lossy(ip)
                    .parse()
                    .map_err(|_| anyhow!("tracker peer entry has an invalid ip"))?;
                let port = entry
                    .get(b"port")
                    .and_then(Value::as_int)
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or_else(|| anyhow!("tracker peer entry has an invalid port"))?;
                peers.push(Peer { ip, port });
            }
            Ok(peers)
        }
        _ => Err(anyhow!("tracker response has no peers")),
    }
}
