//! Logical-port address parsing.
//!
//! Port-security entries come in as strings of the form
//! `"<mac> [<ip>[/plen]]..."`. [`LportAddresses`] is the parsed form the
//! port-security emitter works from.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use eui48::MacAddress;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LportAddressError {
    #[error("no MAC address found in `{0}`")]
    NoMac(String),
    #[error("`{0}` is not an IP address")]
    BadIp(String),
}

/// An IPv4 address with a prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub plen: u8,
}

impl Ipv4Net {
    pub fn mask(&self) -> u32 {
        if self.plen == 0 {
            0
        } else {
            u32::MAX << (32 - self.plen as u32)
        }
    }

    pub fn network(&self) -> u32 {
        u32::from(self.addr) & self.mask()
    }

    /// The subnet broadcast address.
    pub fn bcast(&self) -> u32 {
        self.network() | !self.mask()
    }

    /// True when every bit below the prefix is zero, i.e. the entry names
    /// a subnet rather than a single host.
    pub fn host_bits_zero(&self) -> bool {
        u32::from(self.addr) & !self.mask() == 0
    }
}

/// An IPv6 address with a prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv6Net {
    pub addr: Ipv6Addr,
    pub plen: u8,
}

impl Ipv6Net {
    pub fn mask(&self) -> u128 {
        if self.plen == 0 {
            0
        } else {
            u128::MAX << (128 - self.plen as u32)
        }
    }

    pub fn network(&self) -> u128 {
        u128::from(self.addr) & self.mask()
    }

    pub fn host_bits_zero(&self) -> bool {
        u128::from(self.addr) & !self.mask() == 0
    }
}

/// The addresses a port-security entry grants to a port: one MAC plus any
/// number of IPv4/IPv6 addresses or subnets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LportAddresses {
    pub ea: MacAddress,
    pub ipv4_addrs: Vec<Ipv4Net>,
    pub ipv6_addrs: Vec<Ipv6Net>,
}

impl LportAddresses {
    /// Parse `"<mac> [<ip>[/plen]]..."`. The MAC must come first.
    pub fn parse(s: &str) -> Result<Self, LportAddressError> {
        let mut words = s.split_whitespace();
        let mac = words
            .next()
            .and_then(|w| MacAddress::parse_str(w).ok())
            .ok_or_else(|| LportAddressError::NoMac(s.into()))?;

        let mut out = LportAddresses {
            ea: mac,
            ipv4_addrs: Vec::new(),
            ipv6_addrs: Vec::new(),
        };
        for w in words {
            let (addr, plen) = match w.split_once('/') {
                Some((a, p)) => (
                    a,
                    Some(
                        p.parse::<u8>()
                            .map_err(|_| LportAddressError::BadIp(w.into()))?,
                    ),
                ),
                None => (w, None),
            };
            if let Ok(v4) = Ipv4Addr::from_str(addr) {
                let plen = plen.unwrap_or(32);
                if plen > 32 {
                    return Err(LportAddressError::BadIp(w.into()));
                }
                out.ipv4_addrs.push(Ipv4Net { addr: v4, plen });
            } else if let Ok(v6) = Ipv6Addr::from_str(addr) {
                let plen = plen.unwrap_or(128);
                out.ipv6_addrs.push(Ipv6Net { addr: v6, plen });
            } else {
                return Err(LportAddressError::BadIp(w.into()));
            }
        }
        Ok(out)
    }
}

/// The modified-EUI-64 link-local address derived from a MAC.
pub fn mac_to_lla(mac: MacAddress) -> Ipv6Addr {
    let b = mac.as_bytes();
    Ipv6Addr::from([
        0xfe,
        0x80,
        0,
        0,
        0,
        0,
        0,
        0,
        b[0] ^ 0x02,
        b[1],
        b[2],
        0xff,
        0xfe,
        b[3],
        b[4],
        b[5],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_and_mixed_addresses() {
        let a = LportAddresses::parse("0a:00:00:00:00:01 10.0.0.4 192.168.1.0/24 fd00::4").unwrap();
        assert_eq!(a.ipv4_addrs.len(), 2);
        assert_eq!(a.ipv6_addrs.len(), 1);
        assert_eq!(a.ipv4_addrs[1].plen, 24);
        assert!(a.ipv4_addrs[1].host_bits_zero());
        assert!(!a.ipv4_addrs[0].host_bits_zero());
        assert_eq!(a.ipv4_addrs[1].bcast(), u32::from(Ipv4Addr::new(192, 168, 1, 255)));
    }

    #[test]
    fn rejects_entries_without_mac() {
        assert!(LportAddresses::parse("10.0.0.4").is_err());
        assert!(LportAddresses::parse("").is_err());
    }

    #[test]
    fn lla_derivation() {
        let mac = MacAddress::parse_str("52:54:00:12:34:56").unwrap();
        let lla = mac_to_lla(mac);
        assert_eq!(
            lla,
            Ipv6Addr::from_str("fe80::5054:ff:fe12:3456").unwrap()
        );
    }
}
