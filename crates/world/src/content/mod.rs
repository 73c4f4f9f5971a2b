//! Read-only content: lump checksums, known assets, and prefab definitions.
//!
//! Content is described by a TOML manifest. Checksums are 64-bit and may be
//! written either as integers or as `"0x..."` strings, since TOML integers
//! are signed.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer};

/// 32-bit hash naming an asset (mesh, material, prefab, script).
pub type AssetId = u32;

/// 64-bit identity of one content chunk.
pub type LumpChecksum = u64;

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("failed to read content manifest {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid content manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("prefab {0:#010x} is defined twice")]
    DuplicatePrefab(AssetId),
}

/// Everything the world needs to know about loaded content.
pub trait ContentStore {
    /// Ordered checksums of every loaded lump; order is significant.
    fn checksums(&self) -> Vec<LumpChecksum>;

    fn contains(&self, asset: AssetId) -> bool;

    fn prefab(&self, id: AssetId) -> Option<&PrefabDefinition>;

    /// Prefabs the server instantiates when it starts.
    fn initial_prefabs(&self) -> &[AssetId];
}

#[derive(Debug, Clone, Deserialize)]
pub struct LumpEntry {
    pub name: String,
    #[serde(deserialize_with = "checksum")]
    pub checksum: LumpChecksum,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformPrefab {
    #[serde(default)]
    pub position: [f32; 3],
    #[serde(default = "identity_rotation")]
    pub orientation: [f32; 4],
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshRendererPrefab {
    pub mesh: AssetId,
    pub material: AssetId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointLightPrefab {
    #[serde(default)]
    pub position: [f32; 3],
    pub intensity: [f32; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPrefab {
    pub asset: AssetId,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Entity template: optional components plus child prefabs.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefabDefinition {
    pub id: AssetId,
    #[serde(default)]
    pub name: String,
    pub transform: Option<TransformPrefab>,
    pub mesh_renderer: Option<MeshRendererPrefab>,
    pub point_light: Option<PointLightPrefab>,
    pub script: Option<ScriptPrefab>,
    #[serde(default)]
    pub children: Vec<AssetId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContentManifest {
    pub lumps: Vec<LumpEntry>,
    pub assets: Vec<AssetId>,
    pub initial_prefabs: Vec<AssetId>,
    pub prefabs: Vec<PrefabDefinition>,
}

impl ContentManifest {
    pub fn from_toml_str(source: &str) -> Result<Self, ContentError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ContentError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ContentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

/// In-memory [`ContentStore`] built from a manifest.
#[derive(Debug, Clone, Default)]
pub struct StaticContent {
    manifest: ContentManifest,
    prefab_index: HashMap<AssetId, usize>,
}

impl StaticContent {
    /// Indexes the manifest; a duplicated prefab id keeps the first entry.
    pub fn new(manifest: ContentManifest) -> Self {
        let mut prefab_index = HashMap::new();
        for (index, prefab) in manifest.prefabs.iter().enumerate() {
            if prefab_index.contains_key(&prefab.id) {
                log::warn!("{}", ContentError::DuplicatePrefab(prefab.id));
                continue;
            }
            prefab_index.insert(prefab.id, index);
        }
        Self {
            manifest,
            prefab_index,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ContentError> {
        let manifest = ContentManifest::load(path)?;
        log::info!(
            "Loaded content: {} lumps, {} assets, {} prefabs",
            manifest.lumps.len(),
            manifest.assets.len(),
            manifest.prefabs.len()
        );
        Ok(Self::new(manifest))
    }

    pub fn manifest(&self) -> &ContentManifest {
        &self.manifest
    }
}

impl ContentStore for StaticContent {
    fn checksums(&self) -> Vec<LumpChecksum> {
        self.manifest.lumps.iter().map(|lump| lump.checksum).collect()
    }

    fn contains(&self, asset: AssetId) -> bool {
        self.manifest.assets.contains(&asset) || self.prefab_index.contains_key(&asset)
    }

    fn prefab(&self, id: AssetId) -> Option<&PrefabDefinition> {
        self.prefab_index
            .get(&id)
            .and_then(|&index| self.manifest.prefabs.get(index))
    }

    fn initial_prefabs(&self) -> &[AssetId] {
        &self.manifest.initial_prefabs
    }
}

fn identity_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn checksum<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LumpChecksum, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(value) => Ok(value),
        Raw::Text(text) => {
            let digits = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .unwrap_or(&text);
            u64::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
        }
    }
}
