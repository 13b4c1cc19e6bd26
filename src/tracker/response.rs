use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Error, Result, anyhow};

use crate::bencoding::Value;

const COMPACT_PEER_V4_LEN: usize = 6;
const COMPACT_PEER_V6_LEN: usize = 18;

#[derive(Debug, PartialEq)]
pub struct TrackerResponse {
    pub interval: Duration,
    pub tracker_id: Option<String>,
    pub complete: Option<usize>,
    pub incomplete: Option<usize>,
    pub peers: Vec<SocketAddr>,
}

impl TryFrom<Value> for TrackerResponse {
    type Error = Error;

    fn try_from(mut value: Value) -> Result<Self> {
        if let Some(reason) = value.try_remove_entry("failure reason")? {
            let reason: String = reason.try_into()?;
            return Err(anyhow!("tracker failure: {}", reason));
        }
        let interval = value.remove_entry("interval")?.try_into()?;
        let tracker_id = match value.try_remove_entry("tracker id")? {
            Some(id) => Some(id.try_into()?),
            None => None,
        };
        let complete = match value.try_remove_entry("complete")? {
            Some(complete) => Some(complete.try_into()?),
            None => None,
        };
        let incomplete = match value.try_remove_entry("incomplete")? {
            Some(incomplete) => Some(incomplete.try_into()?),
            None => None,
        };
        let mut peers = match value.remove_entry("peers")? {
            // Compact model: 4 bytes of address and 2 of port per peer, in network byte order
            Value::String(bytes) => compact_peers(&bytes, COMPACT_PEER_V4_LEN)?,
            Value::List(values) => {
                let mut peers = Vec::with_capacity(values.len());
                for value in values {
                    peers.push(peer(value)?);
                }
                peers
            }
            other => return Err(anyhow!("invalid peers {:?}", other)),
        };
        if let Some(Value::String(bytes)) = value.try_remove_entry("peers6")? {
            peers.extend(compact_peers(&bytes, COMPACT_PEER_V6_LEN)?);
        }
        Ok(TrackerResponse {
            interval,
            tracker_id,
            complete,
            incomplete,
            peers,
        })
    }
}

fn compact_peers(bytes: &[u8], len: usize) -> Result<Vec<SocketAddr>> {
    if bytes.len() % len != 0 {
        return Err(anyhow!("compact peers of {} bytes", bytes.len()));
    }
    let peers = bytes
        .chunks_exact(len)
        .map(|chunk| {
            let (ip, port) = chunk.split_at(len - 2);
            let ip = match ip.len() {
                4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
                _ => {
                    let mut octets = [0; 16];
                    octets.copy_from_slice(ip);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
            };
            SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]]))
        })
        .collect();
    Ok(peers)
}

/// Dictionary model: `{"peer id": ..., "ip": ..., "port": ...}`, the peer id is ignored.
fn peer(mut value: Value) -> Result<SocketAddr> {
    let port = value.remove_entry("port")?.try_into()?;
    let ip: String = value.remove_entry("ip")?.try_into()?;
    let ip: IpAddr = ip.parse()?;
    Ok(SocketAddr::new(ip, port))
}
