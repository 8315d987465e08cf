//! Link wiring engine.
//!
//! Realizes one graph edge as a backend data path between two interfaces
//! that the provisioner has already attached. A link is either created on
//! both ends or not at all.

use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::emulation::{BackendError, EmulationBackend, LinkEnd, NodeContext};
use crate::ip::MacAddr;
use crate::provisioner::EmulatedNode;
use crate::topology::{Endpoint, Link, LinkId};

#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("Cannot wire {link}: interface {interface} is not attached to {node}")]
    Unattached { link: LinkId, node: String, interface: String },

    #[error("Cannot wire {link}: {node} has no live context")]
    Released { link: LinkId, node: String },

    #[error("Failed to wire {link}: {source}")]
    Backend {
        link: LinkId,
        #[source]
        source: BackendError,
    },
}

/// One end of a wired link
#[derive(Debug, Clone, Serialize)]
pub struct WiredEnd {
    #[serde(skip)]
    pub context: NodeContext,
    pub interface: String,
    pub mac: MacAddr,
}

impl WiredEnd {
    fn as_link_end(&self) -> LinkEnd<'_> {
        LinkEnd { context: &self.context, interface: &self.interface, mac: self.mac }
    }
}

/// A data path that exists in the backend
#[derive(Debug, Clone, Serialize)]
pub struct WiredLink {
    pub id: LinkId,
    pub left: WiredEnd,
    pub right: WiredEnd,
}

#[derive(Clone)]
pub struct LinkWiringEngine {
    backend: Arc<dyn EmulationBackend>,
}

impl LinkWiringEngine {
    pub fn new(backend: Arc<dyn EmulationBackend>) -> Self {
        Self { backend }
    }

    /// Create the data path for `link` between `left` and `right`.
    ///
    /// Both endpoints must hold a live context with the interface attached;
    /// this is checked before anything is created.
    pub fn wire(&self, link: &Link, left: &EmulatedNode, right: &EmulatedNode) -> Result<WiredLink, WiringError> {
        let left_end = attached_end(link.id, &link.left, left)?;
        let right_end = attached_end(link.id, &link.right, right)?;

        self.backend
            .create_link(&left_end.as_link_end(), &right_end.as_link_end())
            .map_err(|source| WiringError::Backend { link: link.id, source })?;

        debug!("Wired {} ({} <-> {})", link.id, left_end.interface, right_end.interface);
        Ok(WiredLink { id: link.id, left: left_end, right: right_end })
    }

    /// Remove the data path of a wired link
    pub fn unwire(&self, link: &WiredLink) -> Result<(), WiringError> {
        self.backend
            .delete_link(&link.left.as_link_end(), &link.right.as_link_end())
            .map_err(|source| WiringError::Backend { link: link.id, source })?;
        debug!("Unwired {}", link.id);
        Ok(())
    }
}

fn attached_end(link: LinkId, endpoint: &Endpoint, node: &EmulatedNode) -> Result<WiredEnd, WiringError> {
    if node.is_released() {
        return Err(WiringError::Released { link, node: node.name().to_string() });
    }
    let unattached = || WiringError::Unattached {
        link,
        node: node.name().to_string(),
        interface: endpoint.name.clone(),
    };
    if node.id() != endpoint.node {
        return Err(unattached());
    }
    let iface = node.interface(&endpoint.name).ok_or_else(unattached)?;
    Ok(WiredEnd { context: node.context().clone(), interface: iface.name.clone(), mac: iface.mac })
}
