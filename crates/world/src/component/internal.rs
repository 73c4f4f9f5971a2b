//! Components that stay inside one process and are never put on the wire.

use bitflags::bitflags;
use glam::Vec3;

use crate::content::AssetId;
use crate::script::ScriptInstanceId;

/// Stable 64-bit identity handed out by the identifier factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid(pub u64);

/// Marks an entity whose Transform is driven locally; incoming Transform
/// batches skip it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformAuthority;

/// Script instance bound to an entity, with the data it was created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBinding {
    pub script: AssetId,
    pub instance: ScriptInstanceId,
    pub data: Vec<u8>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PointerFlags: u8 {
        const SELECT = 1 << 0;
        const CHANGED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerState {
    Hover,
    Select,
    Drag,
    Deselect,
}

/// Ray-style pointer (mouse or hand) owned by an avatar.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pointer {
    pub origin: Vec3,
    pub direction: Vec3,
    flags: PointerFlags,
}

impl Pointer {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            flags: PointerFlags::empty(),
        }
    }

    pub fn flags(&self) -> PointerFlags {
        self.flags
    }

    pub fn set_select(&mut self, selected: bool) {
        if self.flags.contains(PointerFlags::SELECT) != selected {
            self.flags.toggle(PointerFlags::SELECT);
            self.flags.insert(PointerFlags::CHANGED);
        }
    }

    pub fn state(&self) -> PointerState {
        let select = self.flags.contains(PointerFlags::SELECT);
        let changed = self.flags.contains(PointerFlags::CHANGED);
        match (select, changed) {
            (true, true) => PointerState::Select,
            (true, false) => PointerState::Drag,
            (false, true) => PointerState::Deselect,
            (false, false) => PointerState::Hover,
        }
    }

    /// Clears the edge flag once the frame has consumed it.
    pub fn settle(&mut self) {
        self.flags.remove(PointerFlags::CHANGED);
    }
}
