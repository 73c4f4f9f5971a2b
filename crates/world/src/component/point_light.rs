use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::{ComponentType, SyncState, SynchronizedComponent};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightData {
    pub position: [f32; 3],
    pub intensity: [f32; 3],
}

#[derive(Debug, Clone)]
pub struct PointLight {
    sync: SyncState<PointLightData>,
}

impl PointLight {
    pub fn new(position: Vec3, intensity: Vec3) -> Self {
        Self {
            sync: SyncState::new(PointLightData {
                position: position.to_array(),
                intensity: intensity.to_array(),
            }),
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.sync.data().position)
    }

    pub fn intensity(&self) -> Vec3 {
        Vec3::from_array(self.sync.data().intensity)
    }

    pub fn set_position(&mut self, position: Vec3) -> bool {
        let mut data = *self.sync.data();
        data.position = position.to_array();
        self.sync.write(data)
    }

    pub fn set_intensity(&mut self, intensity: Vec3) -> bool {
        let mut data = *self.sync.data();
        data.intensity = intensity.to_array();
        self.sync.write(data)
    }

}

impl SynchronizedComponent for PointLight {
    type Payload = PointLightData;

    const TYPE: ComponentType = ComponentType::PointLight;

    fn from_payload(payload: PointLightData) -> Self {
        Self {
            sync: SyncState::received(payload),
        }
    }

    fn sync(&self) -> &SyncState<PointLightData> {
        &self.sync
    }

    fn sync_mut(&mut self) -> &mut SyncState<PointLightData> {
        &mut self.sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_writes_stay_clean() {
        let mut light = PointLight::from_payload(PointLightData {
            position: [1.0, 2.0, 3.0],
            intensity: [0.5; 3],
        });
        assert!(!light.is_dirty());
        assert!(!light.set_intensity(Vec3::splat(0.5)));
        assert!(!light.is_dirty());

        assert!(light.set_position(Vec3::ZERO));
        assert!(light.is_dirty());
        assert_eq!(light.position(), Vec3::ZERO);
        assert_eq!(light.intensity(), Vec3::splat(0.5));
    }
}
