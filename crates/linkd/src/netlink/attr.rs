//! Netlink attribute (rtattr/nlattr) handling.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::error::{Error, Result};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Netlink attribute header (mirrors struct nlattr / struct rtattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    pub nla_len: u16,
    pub nla_type: u16,
}

impl NlAttr {
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Attribute type with the nested/byte-order flags stripped.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }
}

/// Iterator over the attributes in a buffer, yielding `(type, payload)`.
///
/// Stops at the first malformed attribute.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (attr, _) = NlAttr::ref_from_prefix(self.data).ok()?;

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            self.data = &[];
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        self.data = self.data.get(nla_align(len)..).unwrap_or(&[]);

        Some((attr.kind(), payload))
    }
}

/// Typed extraction of attribute payloads.
pub mod get {
    use super::*;

    fn array<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
        data.get(..N)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::InvalidAttribute(format!("truncated {what} attribute")))
    }

    pub fn u8(data: &[u8]) -> Result<u8> {
        array::<1>(data, "u8").map(|b| b[0])
    }

    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        array(data, "u16").map(u16::from_ne_bytes)
    }

    pub fn u16_be(data: &[u8]) -> Result<u16> {
        array(data, "u16").map(u16::from_be_bytes)
    }

    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        array(data, "u32").map(u32::from_ne_bytes)
    }

    /// Fixed 32-byte key material (wireguard keys).
    pub fn key(data: &[u8]) -> Result<[u8; 32]> {
        array(data, "key")
    }

    /// Null-terminated (or unterminated) UTF-8 string.
    pub fn string(data: &[u8]) -> Result<&str> {
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(kind: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = NlAttr::new(kind, payload.len()).as_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf.resize(nla_align(buf.len()), 0);
        buf
    }

    #[test]
    fn walks_attributes_with_padding() {
        let mut buf = attr(3, b"wg0\0");
        buf.extend(attr(1, &[7]));
        buf.extend(attr(4 | NLA_F_NESTED, &1420u32.to_ne_bytes()));

        let attrs: Vec<_> = AttrIter::new(&buf).collect();
        assert_eq!(attrs.len(), 3);
        assert_eq!(get::string(attrs[0].1).unwrap(), "wg0");
        assert_eq!(get::u8(attrs[1].1).unwrap(), 7);
        assert_eq!(attrs[2].0, 4);
        assert_eq!(get::u32_ne(attrs[2].1).unwrap(), 1420);
    }

    #[test]
    fn stops_on_overlong_attribute() {
        let mut buf = attr(3, b"eth0");
        buf[0..2].copy_from_slice(&64u16.to_ne_bytes());
        assert_eq!(AttrIter::new(&buf).count(), 0);
    }

    #[test]
    fn truncated_values_are_errors() {
        assert!(get::u32_ne(&[1, 2]).is_err());
        assert!(get::key(&[0; 16]).is_err());
        assert_eq!(get::u16_be(&[0x81, 0x00]).unwrap(), 0x8100);
    }
}
