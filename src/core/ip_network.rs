//! CIDR ranges and address classification used by admission control.
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
    str::FromStr,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpRangeError {
    #[error("Invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("Invalid prefix length '{0}'")]
    InvalidPrefix(String),
}

/// CIDR network (`10.0.0.0/8`, `fd00::/8`) or a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpRange {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, IpRangeError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(IpRangeError::InvalidPrefix(prefix_len.to_string()));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Check if an address falls inside this range. Families never mix.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpRange {
    type Err = IpRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let addr = IpAddr::from_str(ip)
                    .map_err(|_| IpRangeError::InvalidAddress(ip.to_string()))?;
                let prefix_len = prefix
                    .parse::<u8>()
                    .map_err(|_| IpRangeError::InvalidPrefix(prefix.to_string()))?;
                Self::new(addr, prefix_len)
            }
            None => {
                let addr =
                    IpAddr::from_str(s).map_err(|_| IpRangeError::InvalidAddress(s.to_string()))?;
                let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
                Ok(Self { addr, prefix_len })
            }
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Unwrap IPv4-mapped IPv6 addresses (`::ffff:10.0.0.1`) to plain IPv4.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn is_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// Loopback, RFC 1918 private, or IPv6 unique-local.
pub fn is_internal(ip: IpAddr) -> bool {
    match canonical(ip) {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || is_unique_local(&v6),
    }
}

/// Parse an address as it appears in forwarding headers or peer strings:
/// `1.2.3.4`, `1.2.3.4:8080`, `::1`, `[::1]:8080`.
pub fn parse_client_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() {
        return None;
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(canonical(ip));
    }
    if let Ok(sock) = raw.parse::<std::net::SocketAddr>() {
        return Some(canonical(sock.ip()));
    }
    raw.strip_prefix('[')
        .and_then(|rest| rest.split(']').next())
        .and_then(|inner| inner.parse::<IpAddr>().ok())
        .map(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_v4_range_contains() {
        let range: IpRange = "192.168.1.0/24".parse().unwrap();
        assert!(range.contains(ip("192.168.1.1")));
        assert!(range.contains(ip("192.168.1.255")));
        assert!(!range.contains(ip("192.168.2.1")));
        assert!(range.contains(ip("::ffff:192.168.1.7")));
    }

    #[test]
    fn test_single_address_and_zero_prefix() {
        let single: IpRange = "10.0.0.1".parse().unwrap();
        assert!(single.contains(ip("10.0.0.1")));
        assert!(!single.contains(ip("10.0.0.2")));

        let all: IpRange = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(ip("8.8.8.8")));
        assert!(!all.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_v6_range() {
        let range: IpRange = "2001:db8::/32".parse().unwrap();
        assert!(range.contains(ip("2001:db8::dead:beef")));
        assert!(!range.contains(ip("2001:db9::1")));
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(matches!("10.0.0.0/33".parse::<IpRange>(), Err(IpRangeError::InvalidPrefix(_))));
        assert!(matches!("nope/8".parse::<IpRange>(), Err(IpRangeError::InvalidAddress(_))));
        assert!(matches!("10.0.0.0/x".parse::<IpRange>(), Err(IpRangeError::InvalidPrefix(_))));
    }

    #[test]
    fn test_internal_addresses() {
        assert!(is_internal(ip("127.0.0.1")));
        assert!(is_internal(ip("10.1.2.3")));
        assert!(is_internal(ip("172.16.0.1")));
        assert!(is_internal(ip("192.168.0.1")));
        assert!(is_internal(ip("::1")));
        assert!(is_internal(ip("fd12::1")));
        assert!(is_internal(ip("::ffff:10.0.0.1")));
        assert!(!is_internal(ip("8.8.8.8")));
        assert!(!is_internal(ip("2001:db8::1")));
    }

    #[test]
    fn test_parse_client_address_forms() {
        assert_eq!(parse_client_address("1.2.3.4"), Some(ip("1.2.3.4")));
        assert_eq!(parse_client_address(" 1.2.3.4:8080 "), Some(ip("1.2.3.4")));
        assert_eq!(parse_client_address("::1"), Some(ip("::1")));
        assert_eq!(parse_client_address("[::1]:443"), Some(ip("::1")));
        assert_eq!(parse_client_address("[2001:db8::2]"), Some(ip("2001:db8::2")));
        assert_eq!(parse_client_address("unknown"), None);
        assert_eq!(parse_client_address(""), None);
    }
}
