//! Message builder for constructing netlink requests.

use zerocopy::{Immutable, IntoBytes};

use super::attr::{NLA_F_NESTED, NlAttr, nla_align};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned by [`MessageBuilder::nest_start`], consumed by `nest_end`.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct NestToken {
    offset: usize,
}

/// Builder for a single netlink message.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()]
            .copy_from_slice(NlMsgHdr::new(msg_type, flags).as_bytes());
        Self { buf }
    }

    /// Append a fixed-layout family header (ifinfomsg, genlmsghdr, ...).
    pub fn append<T: IntoBytes + Immutable>(&mut self, value: &T) {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.resize(nlmsg_align(self.buf.len()), 0);
    }

    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        self.buf
            .extend_from_slice(NlAttr::new(attr_type, data.len()).as_bytes());
        self.buf.extend_from_slice(data);
        self.buf.resize(nla_align(self.buf.len()), 0);
    }

    pub fn append_attr_u8(&mut self, attr_type: u16, value: u8) {
        self.append_attr(attr_type, &[value]);
    }

    pub fn append_attr_u16(&mut self, attr_type: u16, value: u16) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    pub fn append_attr_u16_be(&mut self, attr_type: u16, value: u16) {
        self.append_attr(attr_type, &value.to_be_bytes());
    }

    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Open a nested attribute; the length is patched in by `nest_end`.
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        self.buf
            .extend_from_slice(NlAttr::new(attr_type | NLA_F_NESTED, 0).as_bytes());
        NestToken { offset }
    }

    pub fn nest_end(&mut self, token: NestToken) {
        let len = (self.buf.len() - token.offset) as u16;
        self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes());
        self.buf.resize(nla_align(self.buf.len()), 0);
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Patch the total length into the header and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::{AttrIter, NLA_HDRLEN, get};
    use crate::netlink::message::{NLM_F_REQUEST, NlMsgHdr};

    #[test]
    fn header_only_message() {
        let msg = MessageBuilder::new(18, NLM_F_REQUEST).finish();
        assert_eq!(msg.len(), NLMSG_HDRLEN);

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDRLEN);
        assert_eq!(header.nlmsg_type, 18);
        assert_eq!(header.nlmsg_flags, NLM_F_REQUEST);
    }

    #[test]
    fn nested_length_covers_children() {
        let mut builder = MessageBuilder::new(16, NLM_F_REQUEST);
        let nest = builder.nest_start(18);
        builder.append_attr_str(1, "bond");
        builder.append_attr_u8(2, 4);
        builder.nest_end(nest);
        let msg = builder.finish();

        let (kind, payload) = AttrIter::new(&msg[NLMSG_HDRLEN..]).next().unwrap();
        assert_eq!(kind, 18);
        // "bond\0" padded to 8, u8 padded to 4, plus two headers
        assert_eq!(payload.len(), 2 * NLA_HDRLEN + 8 + 4);

        let inner: Vec<_> = AttrIter::new(payload).collect();
        assert_eq!(get::string(inner[0].1).unwrap(), "bond");
        assert_eq!(get::u8(inner[1].1).unwrap(), 4);
    }

    #[test]
    fn sequence_and_pid_are_patched() {
        let mut builder = MessageBuilder::new(16, NLM_F_REQUEST);
        builder.set_seq(42);
        builder.set_pid(1234);
        let msg = builder.finish();

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_seq, 42);
        assert_eq!(header.nlmsg_pid, 1234);
    }
}
