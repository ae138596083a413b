//! Link kinds and what the reconciler does for each.
//!
//! Adding a kind means adding a [`LinkKind`] variant and a row in
//! [`LinkKind::behavior`]; the reconcile loop only consults the table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a declared link, matching the kernel's `IFLA_INFO_KIND`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LinkKind {
    /// Hardware interface; the kernel reports no kind.
    #[default]
    Physical,
    Bond,
    Vlan,
    Wireguard,
    /// Any other kernel kind (`veth`, `dummy`, ...), managed by another owner.
    Other(String),
}

/// Settings synchronised after the link exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSync {
    None,
    /// Keys and peers over the wireguard genl family.
    Wireguard,
    /// Bond mode and monitoring timers.
    BondMaster,
}

/// Per-kind reconciler behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindBehavior {
    /// Created by this controller when declared but absent.
    pub creatable: bool,
    /// Kind-specific info can only be set at creation; a mismatch forces
    /// delete and recreate.
    pub immutable_info: bool,
    pub settings: SettingsSync,
    /// ARPHRD type when the declaration does not name one. `None` leaves
    /// the type unchecked.
    pub default_link_type: Option<u16>,
}

const PHYSICAL: KindBehavior = KindBehavior {
    creatable: false,
    immutable_info: false,
    settings: SettingsSync::None,
    default_link_type: Some(libc::ARPHRD_ETHER),
};

const BOND: KindBehavior = KindBehavior {
    creatable: false,
    immutable_info: false,
    settings: SettingsSync::BondMaster,
    default_link_type: Some(libc::ARPHRD_ETHER),
};

const VLAN: KindBehavior = KindBehavior {
    creatable: false,
    immutable_info: true,
    settings: SettingsSync::None,
    default_link_type: Some(libc::ARPHRD_ETHER),
};

const WIREGUARD: KindBehavior = KindBehavior {
    creatable: true,
    immutable_info: false,
    settings: SettingsSync::Wireguard,
    default_link_type: Some(libc::ARPHRD_NONE),
};

// Tunnels and other foreign kinds carry their own types (ipip, gre, tun).
const OTHER: KindBehavior = KindBehavior {
    default_link_type: None,
    ..PHYSICAL
};

impl LinkKind {
    pub fn behavior(&self) -> &'static KindBehavior {
        match self {
            Self::Physical => &PHYSICAL,
            Self::Bond => &BOND,
            Self::Vlan => &VLAN,
            Self::Wireguard => &WIREGUARD,
            Self::Other(_) => &OTHER,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Physical => "physical",
            Self::Bond => "bond",
            Self::Vlan => "vlan",
            Self::Wireguard => "wireguard",
            Self::Other(kind) => kind,
        }
    }

    /// The `IFLA_INFO_KIND` string the kernel reports for this kind.
    pub fn kernel_kind(&self) -> Option<&str> {
        match self {
            Self::Physical => None,
            other => Some(other.as_str()),
        }
    }
}

impl From<&str> for LinkKind {
    fn from(kind: &str) -> Self {
        match kind {
            "" | "physical" => Self::Physical,
            "bond" => Self::Bond,
            "vlan" => Self::Vlan,
            "wireguard" => Self::Wireguard,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for LinkKind {
    fn from(kind: String) -> Self {
        Self::from(kind.as_str())
    }
}

impl From<LinkKind> for String {
    fn from(kind: LinkKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
