//! Deterministic MAC address derivation.

use std::fmt;

use serde::{Serialize, Serializer};

use super::AssignmentError;
use crate::topology::{LinkId, NodeId};

/// A 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// MAC address for the interface `node` has on `link`.
///
/// Layout is `02:00:NN:NN:LL:LL`: locally administered, unicast, with the
/// node index and link index in big-endian order. A node has at most one
/// interface per link, so the address is unique across the topology.
pub fn interface_mac(node: NodeId, link: LinkId) -> Result<MacAddr, AssignmentError> {
    let node_index = u16::try_from(node.0)
        .map_err(|_| AssignmentError::MacSpaceExhausted { what: "node", index: node.0 })?;
    let link_index = u16::try_from(link.0)
        .map_err(|_| AssignmentError::MacSpaceExhausted { what: "link", index: link.0 })?;

    let [n0, n1] = node_index.to_be_bytes();
    let [l0, l1] = link_index.to_be_bytes();
    Ok(MacAddr([0x02, 0x00, n0, n1, l0, l1]))
}
