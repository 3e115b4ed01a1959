//! Names of the VolumeAttachment objects created by the attach/detach controller.
//!
//! The controller doesn't label the attachments it creates, so the only way to
//! find the attachment of a given volume to a given node is to derive its name
//! the same way the controller does: a SHA-256 over the volume handle, the CSI
//! driver name and the node name, concatenated in that order.

use sha2::{Digest, Sha256};

/// Identity of one attachment of a CSI volume to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentKey {
    pub volume_handle: String,
    pub driver_name: String,
    pub node_name: String,
}

impl AttachmentKey {
    pub fn attachment_name(&self) -> String {
        attachment_name(&self.volume_handle, &self.driver_name, &self.node_name)
    }
}

/// Returns `csi-` followed by 64 lowercase hex digits.
pub fn attachment_name(volume_handle: &str, driver_name: &str, node_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(volume_handle.as_bytes());
    hasher.update(driver_name.as_bytes());
    hasher.update(node_name.as_bytes());
    format!("csi-{}", hex::encode(hasher.finalize()))
}
