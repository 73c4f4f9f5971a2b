use bytemuck::{Pod, Zeroable};

use super::{ComponentType, SyncState, SynchronizedComponent};
use crate::content::{AssetId, ContentStore};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshRendererData {
    pub mesh: AssetId,
    pub material: AssetId,
}

/// Mesh/material pair drawn at the entity's transform.
#[derive(Debug, Clone)]
pub struct MeshRenderer {
    sync: SyncState<MeshRendererData>,
    resolved: bool,
}

impl MeshRenderer {
    pub fn new(mesh: AssetId, material: AssetId) -> Self {
        Self {
            sync: SyncState::new(MeshRendererData { mesh, material }),
            resolved: false,
        }
    }

    pub fn mesh(&self) -> AssetId {
        self.sync.data().mesh
    }

    pub fn material(&self) -> AssetId {
        self.sync.data().material
    }

    /// Whether both assets were found in local content on the last refresh.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

impl SynchronizedComponent for MeshRenderer {
    type Payload = MeshRendererData;

    const TYPE: ComponentType = ComponentType::MeshRenderer;

    fn from_payload(payload: MeshRendererData) -> Self {
        Self {
            sync: SyncState::received(payload),
            resolved: false,
        }
    }

    fn sync(&self) -> &SyncState<MeshRendererData> {
        &self.sync
    }

    fn sync_mut(&mut self) -> &mut SyncState<MeshRendererData> {
        &mut self.sync
    }

    fn refresh(&mut self, content: &dyn ContentStore) {
        let data = *self.sync.data();
        let mesh = content.contains(data.mesh);
        let material = content.contains(data.material);
        if !mesh {
            log::warn!("Mesh asset {:#010x} is not available locally", data.mesh);
        }
        if !material {
            log::warn!("Material asset {:#010x} is not available locally", data.material);
        }
        self.resolved = mesh && material;
    }
}
