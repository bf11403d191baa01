//! Address and port-list helpers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Strip the port from `host:port` or `[v6]:port`.
///
/// Bare IPv6 addresses (more than one colon, no brackets) are returned as-is.
pub fn ip_of_addr(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => "",
        };
    }

    match (addr.find(':'), addr.rfind(':')) {
        (Some(first), Some(last)) if first == last => &addr[..first],
        _ => addr,
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Expand a port list such as `"80,8000-8002"`.
///
/// Malformed entries are skipped.
pub fn parse_ports(list: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for item in list.split(',') {
        let bounds: Vec<&str> = item.split('-').collect();
        match bounds.as_slice() {
            [start, end] => {
                if let (Some(start), Some(end)) = (parse_port(start), parse_port(end)) {
                    ports.extend(start..=end);
                }
            }
            [single] => {
                if let Some(port) = parse_port(single) {
                    ports.push(port);
                }
            }
            _ => {}
        }
    }
    ports
}

/// Split a newline-separated target list, dropping blank lines
pub fn split_targets(targets: &str) -> Vec<String> {
    targets
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decode a raw 4- or 16-byte address
pub fn decode_ip(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Raw bytes of an address, the inverse of [`decode_ip`]
pub fn encode_ip(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
