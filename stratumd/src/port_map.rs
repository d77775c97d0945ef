// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types for mapping singleton ports to SDE port handles.
//!
//! A _singleton port_ is the operator's name for a front panel port: a
//! numeric id, chosen in the chassis config, attached to a physical
//! (slot, port, channel) location.  Those ids are stable across reboots and
//! are what a controller uses in P4Runtime requests and gNMI paths.
//!
//! The SDE knows nothing of them.  It names ports by a _device port_ (or SDK
//! port), an integer that it assigns when the port is created and which is
//! only meaningful while the current pipeline is installed.  Every value that
//! crosses between the two worlds is converted here, and the conversion
//! fails loudly in both directions when a port isn't known: quietly
//! defaulting would send an operator's command to the wrong port.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::from_sde;
use crate::types::StratumError;
use crate::types::StratumResult;
use aal::AsicError;
use aal::DeviceId;
use aal::SdeInterface;
use aal::SdkPort;
use common::chassis::PortKey;

/// A bijection between singleton port ids and SDE ports.  Once built, a
/// mapping is never modified; a new chassis config produces a new mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortMapping {
    to_sdk: BTreeMap<u32, SdkPort>,
    to_singleton: BTreeMap<SdkPort, u32>,
}

impl PortMapping {
    pub fn new() -> Self {
        PortMapping::default()
    }

    /// Add a pair to the mapping.  Each id and each SDE port may appear only
    /// once.
    pub fn insert(
        &mut self,
        port_id: u32,
        sdk_port: SdkPort,
    ) -> StratumResult<()> {
        if let Some(existing) = self.to_singleton.get(&sdk_port) {
            return Err(StratumError::InvalidParam(format!(
                "SDK port {sdk_port} is already mapped to port {existing}"
            )));
        }
        self.insert_one_way(port_id, sdk_port)?;
        self.to_singleton.insert(sdk_port, port_id);
        Ok(())
    }

    /// Map `port_id` to `sdk_port` without the reverse mapping.
    pub fn insert_one_way(
        &mut self,
        port_id: u32,
        sdk_port: SdkPort,
    ) -> StratumResult<()> {
        match self.to_sdk.entry(port_id) {
            Entry::Occupied(e) => Err(StratumError::InvalidParam(format!(
                "port {port_id} is already mapped to SDK port {}",
                e.get()
            ))),
            Entry::Vacant(e) => {
                e.insert(sdk_port);
                Ok(())
            }
        }
    }

    pub fn to_sdk_port(&self, port_id: u32) -> StratumResult<SdkPort> {
        self.to_sdk.get(&port_id).copied().ok_or_else(|| {
            StratumError::NotFound(format!(
                "port {port_id} has no SDK port mapping"
            ))
        })
    }

    pub fn to_singleton_port(&self, sdk_port: SdkPort) -> StratumResult<u32> {
        self.to_singleton.get(&sdk_port).copied().ok_or_else(|| {
            StratumError::NotFound(format!(
                "SDK port {sdk_port} has no singleton port mapping"
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.to_sdk.len()
    }
}

/// The current port mapping of every device.  Readers get a snapshot of a
/// device's mapping; a chassis push replaces it wholesale.
#[derive(Debug, Default)]
pub struct PortMapper {
    mappings: RwLock<BTreeMap<DeviceId, Arc<PortMapping>>>,
}

impl PortMapper {
    pub fn new() -> Self {
        PortMapper::default()
    }

    /// Ask the SDE which of its ports lives at `key`.
    pub fn register_port(
        sde: &dyn SdeInterface,
        device: DeviceId,
        key: &PortKey,
    ) -> StratumResult<SdkPort> {
        match sde.get_port_id_from_port_key(device, key) {
            Err(AsicError::Missing(_)) => Err(StratumError::NotFound(format!(
                "no SDK port at {key} on device {device}"
            ))),
            Err(e) => Err(from_sde("get_port_id_from_port_key", e)),
            Ok(port) => Ok(port),
        }
    }

    /// Replace the device's mapping.
    pub fn install(&self, device: DeviceId, mapping: PortMapping) {
        self.mappings.write().insert(device, Arc::new(mapping));
    }

    pub fn clear(&self) {
        self.mappings.write().clear();
    }

    pub fn mapping(&self, device: DeviceId) -> Option<Arc<PortMapping>> {
        self.mappings.read().get(&device).cloned()
    }

    fn device_mapping(
        &self,
        device: DeviceId,
    ) -> StratumResult<Arc<PortMapping>> {
        self.mapping(device).ok_or_else(|| {
            StratumError::NotFound(format!(
                "no ports configured on device {device}"
            ))
        })
    }

    pub fn to_sdk_port(
        &self,
        device: DeviceId,
        port_id: u32,
    ) -> StratumResult<SdkPort> {
        self.device_mapping(device)?.to_sdk_port(port_id)
    }

    pub fn to_singleton_port(
        &self,
        device: DeviceId,
        sdk_port: SdkPort,
    ) -> StratumResult<u32> {
        self.device_mapping(device)?.to_singleton_port(sdk_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;
    use asic::AsicConfig;
    use asic::Handle;

    fn test_logger() -> slog::Logger {
        crate::test_utils::test_logger()
    }

    #[test]
    fn test_bijection() {
        let sde = Handle::new(&test_logger(), &AsicConfig::default()).unwrap();
        let ports = [
            (1u32, PortKey::new(1, 1, 0)),
            (2, PortKey::new(1, 1, 1)),
            (12345, PortKey::new(1, 17, 0)),
        ];
        let mut mapping = PortMapping::new();
        for (id, key) in &ports {
            let sdk = PortMapper::register_port(&sde, 0, key).unwrap();
            mapping.insert(*id, sdk).unwrap();
        }
        let mapper = PortMapper::new();
        mapper.install(0, mapping);

        for (id, _) in &ports {
            let sdk = mapper.to_sdk_port(0, *id).unwrap();
            assert_eq!(mapper.to_singleton_port(0, sdk).unwrap(), *id);
        }
        assert_eq!(
            mapper.to_sdk_port(0, 128).unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            mapper.to_singleton_port(0, 999).unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            mapper.to_sdk_port(1, 1).unwrap_err().code(),
            ErrorCode::NotFound
        );

        mapper.clear();
        assert!(mapper.mapping(0).is_none());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut mapping = PortMapping::new();
        mapping.insert(1, 10).unwrap();
        assert!(mapping.insert(1, 11).is_err());
        assert!(mapping.insert(2, 10).is_err());
        mapping.insert_one_way(0, 0).unwrap();
        assert_eq!(mapping.to_sdk_port(0).unwrap(), 0);
        assert!(mapping.to_singleton_port(0).is_err());
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_unknown_key() {
        let sde = Handle::new(&test_logger(), &AsicConfig::default()).unwrap();
        let err =
            PortMapper::register_port(&sde, 0, &PortKey::new(1, 40, 0))
                .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
