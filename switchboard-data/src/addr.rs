//! Address constants.
//!
//! An [`AddrConstant`] is one element of an address set: an IPv4, IPv6 or
//! MAC literal with an optional mask. Values are stored as the raw bits
//! in the low end of a `u128` so that annotations and comparisons are
//! uniform across families.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use eui48::MacAddress;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The address family of a constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrFamily {
    V4,
    V6,
    Mac,
}

impl AddrFamily {
    /// Number of significant bits for this family.
    pub fn width(self) -> u32 {
        match self {
            AddrFamily::V4 => 32,
            AddrFamily::V6 => 128,
            AddrFamily::Mac => 48,
        }
    }

    /// The exact-match mask for this family.
    pub fn exact_mask(self) -> u128 {
        match self {
            AddrFamily::V4 => u32::MAX as u128,
            AddrFamily::V6 => u128::MAX,
            AddrFamily::Mac => (1u128 << 48) - 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("`{0}` is not an IPv4, IPv6 or MAC literal")]
    NotAnAddress(String),
    #[error("invalid prefix length {plen} for {family:?} address")]
    BadPrefix { family: AddrFamily, plen: u32 },
}

/// One address-set element: an address literal with an optional mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddrConstant {
    pub family: AddrFamily,
    /// Raw address bits in the low `family.width()` bits.
    pub value: u128,
    /// Explicit mask, if the literal carried one.
    pub mask: Option<u128>,
}

impl AddrConstant {
    pub fn v4(addr: Ipv4Addr) -> Self {
        AddrConstant {
            family: AddrFamily::V4,
            value: u32::from(addr) as u128,
            mask: None,
        }
    }

    pub fn v6(addr: Ipv6Addr) -> Self {
        AddrConstant {
            family: AddrFamily::V6,
            value: u128::from(addr),
            mask: None,
        }
    }

    pub fn mac(addr: MacAddress) -> Self {
        let mut value = 0u128;
        for b in addr.as_bytes() {
            value = (value << 8) | *b as u128;
        }
        AddrConstant {
            family: AddrFamily::Mac,
            value,
            mask: None,
        }
    }

    /// The mask this constant matches under: the explicit one if given,
    /// otherwise the family's exact-match mask.
    pub fn effective_mask(&self) -> u128 {
        self.mask.unwrap_or_else(|| self.family.exact_mask())
    }

    /// A synthetic sibling of this constant, guaranteed to differ: the
    /// lowest byte is incremented (mod 256).
    pub fn with_bumped_low_byte(&self) -> Self {
        let low = (self.value & 0xff) as u8;
        AddrConstant {
            value: (self.value & !0xff) | low.wrapping_add(1) as u128,
            ..*self
        }
    }

    /// Parse `addr[/plen]` where `addr` is an IPv4 dotted quad, an IPv6
    /// literal or a colon-separated MAC.
    pub fn parse(s: &str) -> Result<Self, AddrParseError> {
        let (addr, plen) = match s.split_once('/') {
            Some((a, p)) => {
                let plen = p
                    .parse::<u32>()
                    .map_err(|_| AddrParseError::NotAnAddress(s.into()))?;
                (a, Some(plen))
            }
            None => (s, None),
        };

        let mut c = if let Ok(v4) = Ipv4Addr::from_str(addr) {
            Self::v4(v4)
        } else if let Ok(mac) = MacAddress::parse_str(addr) {
            Self::mac(mac)
        } else if let Ok(v6) = Ipv6Addr::from_str(addr) {
            Self::v6(v6)
        } else {
            return Err(AddrParseError::NotAnAddress(s.into()));
        };

        if let Some(plen) = plen {
            c.mask = Some(prefix_mask(c.family, plen)?);
        }
        Ok(c)
    }

    /// `prefix_len` bits of ones from the top of the family's width.
    pub fn prefix_mask(family: AddrFamily, plen: u32) -> Result<u128, AddrParseError> {
        prefix_mask(family, plen)
    }
}

fn prefix_mask(family: AddrFamily, plen: u32) -> Result<u128, AddrParseError> {
    let width = family.width();
    if plen > width {
        return Err(AddrParseError::BadPrefix { family, plen });
    }
    if plen == 0 {
        return Ok(0);
    }
    let ones = if plen == 128 {
        u128::MAX
    } else {
        (1u128 << plen) - 1
    };
    Ok(ones << (width - plen))
}

impl fmt::Debug for AddrConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for AddrConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddrFamily::V4 => write!(f, "{}", Ipv4Addr::from(self.value as u32))?,
            AddrFamily::V6 => write!(f, "{}", Ipv6Addr::from(self.value))?,
            AddrFamily::Mac => {
                let b = (self.value as u64).to_be_bytes();
                write!(
                    f,
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    b[2], b[3], b[4], b[5], b[6], b[7]
                )?;
            }
        }
        if let Some(mask) = self.mask {
            write!(f, "/{}", mask.count_ones())?;
        }
        Ok(())
    }
}
