use std::fmt;

use crate::{bail_value, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

/// A concrete device. Equality includes the ordinal, so `cuda:0 != cuda:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl Device {
    pub const fn cpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            ordinal,
        }
    }

    pub const fn cuda(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            ordinal,
        }
    }

    /// The device eager and define-by-run graphs compute on.
    pub const fn host() -> Self {
        Self::cpu(0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu:{}", self.ordinal),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.ordinal),
        }
    }
}

/// An ordered set of devices. Position in the group is the device index used
/// by distributed states.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceGroup(Vec<Device>);

impl DeviceGroup {
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        for (i, d) in devices.iter().enumerate() {
            if devices[..i].contains(d) {
                bail_value!("device {d} appears twice in device group");
            }
        }
        Ok(Self(devices))
    }

    pub fn single(device: Device) -> Self {
        Self(vec![device])
    }

    /// `cuda:{start}..cuda:{start + n}`.
    pub fn cuda_range(start: usize, n: usize) -> Self {
        Self((start..start + n).map(Device::cuda).collect())
    }

    pub fn devices(&self) -> &[Device] {
        &self.0
    }

    pub fn num_devices(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.0.contains(device)
    }

    pub fn index_of(&self, device: &Device) -> Option<usize> {
        self.0.iter().position(|d| d == device)
    }

    pub fn get(&self, index: usize) -> Option<Device> {
        self.0.get(index).copied()
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// One device group per pipeline (hetero id) for a single strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceGroupUnion(Vec<DeviceGroup>);

impl DeviceGroupUnion {
    pub fn new(groups: Vec<DeviceGroup>) -> Result<Self> {
        let merged: Vec<Device> = groups.iter().flat_map(|g| g.devices().to_vec()).collect();
        DeviceGroup::new(merged)?;
        Ok(Self(groups))
    }

    pub fn single(group: DeviceGroup) -> Self {
        Self(vec![group])
    }

    pub fn groups(&self) -> &[DeviceGroup] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, hetero_id: usize) -> Option<&DeviceGroup> {
        self.0.get(hetero_id)
    }

    /// All devices of the union in pipeline order.
    pub fn merged(&self) -> DeviceGroup {
        DeviceGroup(self.0.iter().flat_map(|g| g.devices().to_vec()).collect())
    }

    pub fn hetero_id_of(&self, device: &Device) -> Option<usize> {
        self.0.iter().position(|g| g.contains(device))
    }
}

/// Device-group unions indexed by strategy id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceGroupHierarchy(Vec<DeviceGroupUnion>);

impl DeviceGroupHierarchy {
    pub fn new(unions: Vec<DeviceGroupUnion>) -> Self {
        Self(unions)
    }

    /// The same single group under every one of `num_strategies` strategies.
    pub fn uniform(group: DeviceGroup, num_strategies: usize) -> Self {
        Self(vec![DeviceGroupUnion::single(group); num_strategies])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, strategy_id: usize) -> Option<&DeviceGroupUnion> {
        self.0.get(strategy_id)
    }

    pub fn push(&mut self, union: DeviceGroupUnion) {
        self.0.push(union)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_devices_are_rejected() {
        assert!(DeviceGroup::new(vec![Device::cuda(0), Device::cuda(0)]).is_err());
        let a = DeviceGroup::cuda_range(0, 2);
        let b = DeviceGroup::cuda_range(1, 2);
        assert!(DeviceGroupUnion::new(vec![a, b]).is_err());
    }

    #[test]
    fn union_lookup() {
        let u = DeviceGroupUnion::new(vec![
            DeviceGroup::cuda_range(0, 2),
            DeviceGroup::cuda_range(2, 2),
        ])
        .unwrap();
        assert_eq!(u.hetero_id_of(&Device::cuda(3)), Some(1));
        assert_eq!(u.merged().num_devices(), 4);
        assert_eq!(u.merged().index_of(&Device::cuda(2)), Some(2));
        assert_eq!(format!("{}", u.merged()), "[cuda:0, cuda:1, cuda:2, cuda:3]");
    }
}
