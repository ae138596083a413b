//! Async netlink socket with request/ACK/dump helpers.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{MessageIter, NlMsgError};

/// Receive buffer size; large enough for a full dump batch.
const RECV_BUF_SIZE: usize = 32768;

/// Netlink protocol families used by linkd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Routing/device hook (links).
    Route,
    /// Generic netlink (wireguard).
    Generic,
}

impl Protocol {
    fn as_isize(self) -> isize {
        match self {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        }
    }
}

/// Multicast groups for NETLINK_ROUTE.
pub mod rtnetlink_groups {
    pub const RTNLGRP_LINK: u32 = 1;
}

/// Async netlink socket.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    seq: AtomicU32,
    pid: u32,
    protocol: Protocol,
}

impl NetlinkSocket {
    /// Open and bind a socket for the given protocol.
    pub fn new(protocol: Protocol) -> Result<Self> {
        let mut socket = Socket::new(protocol.as_isize())?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;

        // Extended ACK is optional; older kernels reject it.
        socket.set_ext_ack(true).ok();

        Ok(Self {
            pid: addr.port_number(),
            fd: AsyncFd::new(socket)?,
            seq: AtomicU32::new(1),
            protocol,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Join a multicast group (e.g. [`rtnetlink_groups::RTNLGRP_LINK`]).
    pub fn add_membership(&mut self, group: u32) -> Result<()> {
        self.fd.get_mut().add_membership(group)?;
        Ok(())
    }

    async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram (possibly several packed messages).
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(RECV_BUF_SIZE);
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Stamp sequence/port id and send; returns the sequence number used.
    async fn submit(&self, mut builder: MessageBuilder) -> Result<u32> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        builder.set_seq(seq);
        builder.set_pid(self.pid);
        self.send(&builder.finish()).await?;
        Ok(seq)
    }

    /// Send a request built with `NLM_F_ACK` and wait for its ACK.
    pub async fn request_ack(&self, builder: MessageBuilder) -> Result<()> {
        let seq = self.submit(builder).await?;
        loop {
            let data = self.recv().await?;
            for msg in MessageIter::new(&data) {
                let (header, payload) = msg?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    return NlMsgError::from_bytes(payload)?.into_result();
                }
            }
        }
    }

    /// Send a dump request and collect the payload of every reply message.
    pub async fn dump(&self, builder: MessageBuilder) -> Result<Vec<Vec<u8>>> {
        let seq = self.submit(builder).await?;
        let mut replies = Vec::new();
        loop {
            let data = self.recv().await?;
            for msg in MessageIter::new(&data) {
                let (header, payload) = msg?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_done() {
                    return Ok(replies);
                }
                if header.is_error() {
                    NlMsgError::from_bytes(payload)?.into_result()?;
                    continue;
                }
                replies.push(payload.to_vec());
            }
        }
    }

    /// Send a request answered by exactly one data message (plus ACK or error).
    pub async fn request_one(&self, builder: MessageBuilder) -> Result<Vec<u8>> {
        let seq = self.submit(builder).await?;
        loop {
            let data = self.recv().await?;
            for msg in MessageIter::new(&data) {
                let (header, payload) = msg?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    NlMsgError::from_bytes(payload)?.into_result()?;
                    return Err(Error::InvalidMessage("ACK without reply".into()));
                }
                return Ok(payload.to_vec());
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}
