//! Generic netlink connection with family resolution.
//!
//! GENL messages carry a 4-byte `genlmsghdr` (command, version) between the
//! netlink header and the attributes. Family IDs are assigned dynamically by
//! the kernel and resolved by name through the `nlctrl` controller.

use std::collections::HashMap;
use std::sync::Mutex;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::attr::{AttrIter, get};
use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use super::socket::{NetlinkSocket, Protocol};

/// Generic netlink controller family ID.
pub const GENL_ID_CTRL: u16 = 0x10;

const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

/// Generic netlink message header (mirrors struct genlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GenlMsgHdr {
    pub cmd: u8,
    pub version: u8,
    pub reserved: u16,
}

pub const GENL_HDRLEN: usize = std::mem::size_of::<GenlMsgHdr>();

impl GenlMsgHdr {
    pub const fn new(cmd: u8, version: u8) -> Self {
        Self {
            cmd,
            version,
            reserved: 0,
        }
    }
}

/// Strip the genl header from a reply payload, returning the attributes.
pub fn attributes(payload: &[u8]) -> Result<&[u8]> {
    payload.get(GENL_HDRLEN..).ok_or(Error::Truncated {
        expected: GENL_HDRLEN,
        actual: payload.len(),
    })
}

/// Generic netlink connection.
///
/// Resolved family IDs are cached for the lifetime of the connection.
pub struct GenlConnection {
    socket: NetlinkSocket,
    families: Mutex<HashMap<String, u16>>,
}

impl GenlConnection {
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new(Protocol::Generic)?,
            families: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a family name to its ID.
    ///
    /// Returns [`Error::FamilyNotFound`] when the kernel does not know the
    /// family (module not loaded).
    pub async fn family_id(&self, name: &str) -> Result<u16> {
        if let Some(&id) = self.cache().get(name) {
            return Ok(id);
        }

        let mut builder = MessageBuilder::new(GENL_ID_CTRL, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&GenlMsgHdr::new(CTRL_CMD_GETFAMILY, 1));
        builder.append_attr_str(CTRL_ATTR_FAMILY_NAME, name);

        let reply = match self.socket.request_one(builder).await {
            Err(e) if e.is_not_found() => {
                return Err(Error::FamilyNotFound {
                    name: name.to_string(),
                });
            }
            other => other?,
        };

        let id = AttrIter::new(attributes(&reply)?)
            .find(|(kind, _)| *kind == CTRL_ATTR_FAMILY_ID)
            .map(|(_, data)| get::u16_ne(data))
            .transpose()?
            .ok_or_else(|| Error::FamilyNotFound {
                name: name.to_string(),
            })?;

        tracing::debug!(family = name, id, "resolved genl family");
        self.cache().insert(name.to_string(), id);
        Ok(id)
    }

    /// Send a command and wait for its ACK.
    pub async fn command(
        &self,
        family: u16,
        cmd: u8,
        version: u8,
        build: impl FnOnce(&mut MessageBuilder),
    ) -> Result<()> {
        let mut builder = MessageBuilder::new(family, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&GenlMsgHdr::new(cmd, version));
        build(&mut builder);
        self.socket.request_ack(builder).await
    }

    /// Send a dump command and collect every reply payload (genl header
    /// included).
    pub async fn dump_command(
        &self,
        family: u16,
        cmd: u8,
        version: u8,
        build: impl FnOnce(&mut MessageBuilder),
    ) -> Result<Vec<Vec<u8>>> {
        let mut builder = MessageBuilder::new(family, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&GenlMsgHdr::new(cmd, version));
        build(&mut builder);
        self.socket.dump(builder).await
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, u16>> {
        self.families.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_four_bytes() {
        assert_eq!(GENL_HDRLEN, 4);
        assert_eq!(GenlMsgHdr::new(1, 2).as_bytes(), &[1, 2, 0, 0]);
    }

    #[test]
    fn attributes_skip_header() {
        let payload = [0u8, 1, 0, 0, 8, 0, 1, 0];
        assert_eq!(attributes(&payload).unwrap(), &[8, 0, 1, 0]);
        assert!(matches!(
            attributes(&[1, 2]),
            Err(Error::Truncated { expected: 4, .. })
        ));
    }
}
