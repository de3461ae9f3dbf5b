//! The GATT attribute tree cloned from the upstream device.
//!
//! The tree is built once per session, either from a live discovery or
//! from a persisted snapshot, and is immutable afterwards. The copy handed
//! to the local GATT server is filtered: BlueZ registers its own Generic
//! Access and Generic Attribute services, and registering duplicates makes
//! the whole application fail.

use uuid::Uuid;

use crate::api::bleuuid::{uuid_from_u16, BleUuid};
use crate::api::CharPropFlags;

/// Generic Access Profile service, provided by the local stack.
pub const GAP_SERVICE: Uuid = uuid_from_u16(0x1800);
/// Generic Attribute Profile service, provided by the local stack.
pub const GATT_SERVICE: Uuid = uuid_from_u16(0x1801);
/// The Service Changed characteristic inside the GATT profile service.
pub const SERVICE_CHANGED: Uuid = uuid_from_u16(0x2a05);
/// Client Characteristic Configuration Descriptor.
pub const CCCD: Uuid = uuid_from_u16(0x2902);

/// Base local handle used when a snapshot does not carry upstream handles.
const HANDLE_BASE: u16 = 0x0010;

/// Human readable names for the well-known 16-bit UUIDs this tool runs
/// into most often, mirrored from the assigned-numbers lists.
pub fn common_name(uuid: Uuid) -> Option<&'static str> {
    let short = uuid.to_ble_u16()?;
    let name = match short {
        0x1800 => "Generic Access",
        0x1801 => "Generic Attribute",
        0x180a => "Device Information",
        0x180d => "Heart Rate",
        0x180f => "Battery Service",
        0x1812 => "Human Interface Device",
        0x2a00 => "Device Name",
        0x2a01 => "Appearance",
        0x2a05 => "Service Changed",
        0x2a19 => "Battery Level",
        0x2a29 => "Manufacturer Name String",
        0x2a37 => "Heart Rate Measurement",
        0x2901 => "Characteristic User Description",
        0x2902 => "Client Characteristic Configuration",
        _ => return None,
    };
    Some(name)
}

/// A descriptor attached to a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDef {
    pub uuid: Uuid,
    pub name: Option<String>,
}

impl DescriptorDef {
    pub fn new(uuid: Uuid) -> Self {
        DescriptorDef {
            uuid,
            name: common_name(uuid).map(str::to_string),
        }
    }
}

/// A characteristic, carrying the 16-bit handle the *upstream* peripheral
/// uses to address it. The relay keys every upstream operation on that
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDef {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub handle: u16,
    pub properties: CharPropFlags,
    /// Last known value, filled when a snapshot is stored or loaded. Used
    /// as the backing source when running without an upstream connection.
    pub value: Option<Vec<u8>>,
    /// Declared length constraint for client writes, if any.
    pub max_len: Option<usize>,
    pub descriptors: Vec<DescriptorDef>,
}

impl CharacteristicDef {
    pub fn new(uuid: Uuid, handle: u16, properties: CharPropFlags) -> Self {
        CharacteristicDef {
            uuid,
            name: common_name(uuid).map(str::to_string),
            handle,
            properties,
            value: None,
            max_len: None,
            descriptors: Vec::new(),
        }
    }
}

/// A primary or secondary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDef>,
}

impl ServiceDef {
    pub fn new(uuid: Uuid) -> Self {
        ServiceDef {
            uuid,
            name: common_name(uuid).map(str::to_string),
            primary: true,
            characteristics: Vec::new(),
        }
    }
}

/// The ordered service tree of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTree {
    services: Vec<ServiceDef>,
}

impl AttributeTree {
    pub fn new(services: Vec<ServiceDef>) -> Self {
        let mut tree = AttributeTree { services };
        tree.assign_missing_handles();
        tree
    }

    pub fn services(&self) -> &[ServiceDef] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// The copy suitable for registration with the local stack: everything
    /// except the GAP and GATT profile services.
    pub fn exposed(&self) -> AttributeTree {
        let services = self
            .services
            .iter()
            .filter(|service| {
                let keep = service.uuid != GAP_SERVICE && service.uuid != GATT_SERVICE;
                if !keep {
                    log::debug!(
                        "filtering service {} from the exposed database",
                        service.uuid.to_short_string()
                    );
                }
                keep
            })
            .cloned()
            .collect();
        AttributeTree { services }
    }

    /// The upstream handle of a characteristic addressed by service and
    /// characteristic UUID.
    pub fn find_handle(&self, service: Uuid, characteristic: Uuid) -> Option<u16> {
        self.services
            .iter()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .map(|c| c.handle)
    }

    /// Look a characteristic up by its upstream handle.
    pub fn find_characteristic(&self, handle: u16) -> Option<(&ServiceDef, &CharacteristicDef)> {
        for service in &self.services {
            for characteristic in &service.characteristics {
                if characteristic.handle == handle {
                    return Some((service, characteristic));
                }
            }
        }
        None
    }

    /// The upstream handle of the Service Changed characteristic, looked
    /// up in the *unfiltered* tree.
    pub fn service_changed_handle(&self) -> Option<u16> {
        self.find_handle(GATT_SERVICE, SERVICE_CHANGED)
    }

    /// Give characteristics without an upstream handle one in attribute
    /// order, starting at a fixed base. Snapshots written by hand often
    /// leave handles out; the relay still needs distinct keys.
    fn assign_missing_handles(&mut self) {
        let mut used: Vec<u16> = self
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter().map(|c| c.handle))
            .filter(|h| *h != 0)
            .collect();
        let mut next = HANDLE_BASE;
        for service in &mut self.services {
            for characteristic in &mut service.characteristics {
                if characteristic.handle == 0 {
                    while used.contains(&next) {
                        next += 1;
                    }
                    characteristic.handle = next;
                    used.push(next);
                    next += 1;
                }
            }
        }
    }

    /// Log the whole tree the way a discovery run prints it.
    pub fn log_summary(&self) {
        for service in &self.services {
            log::info!(
                "service: {} [{}]",
                service.uuid.to_short_string(),
                service.name.as_deref().unwrap_or("-"),
            );
            for characteristic in &service.characteristics {
                log::info!(
                    "    char: {} [{}] handle {:#06x} props {:?}",
                    characteristic.uuid.to_short_string(),
                    characteristic.name.as_deref().unwrap_or("-"),
                    characteristic.handle,
                    characteristic.properties.names(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_services(shorts: &[u16]) -> AttributeTree {
        let services = shorts
            .iter()
            .map(|short| {
                let mut service = ServiceDef::new(uuid_from_u16(*short));
                service.characteristics.push(CharacteristicDef::new(
                    uuid_from_u16(0x2a19),
                    0x002a,
                    CharPropFlags::READ,
                ));
                service
            })
            .collect();
        AttributeTree::new(services)
    }

    #[test]
    fn gap_and_gatt_filtered() {
        let tree = tree_with_services(&[0x1800, 0x1801, 0x180f]);
        let exposed = tree.exposed();
        let uuids: Vec<Uuid> = exposed.services().iter().map(|s| s.uuid).collect();
        assert_eq!(uuids, vec![uuid_from_u16(0x180f)]);
        // the unfiltered tree is untouched
        assert_eq!(tree.services().len(), 3);
    }

    #[test]
    fn find_handle_by_uuids() {
        let tree = tree_with_services(&[0x180f]);
        assert_eq!(
            tree.find_handle(uuid_from_u16(0x180f), uuid_from_u16(0x2a19)),
            Some(0x002a)
        );
        assert_eq!(
            tree.find_handle(uuid_from_u16(0x180d), uuid_from_u16(0x2a19)),
            None
        );
    }

    #[test]
    fn missing_handles_assigned_in_order() {
        let mut service = ServiceDef::new(uuid_from_u16(0x180f));
        service.characteristics.push(CharacteristicDef::new(
            uuid_from_u16(0x2a19),
            0,
            CharPropFlags::READ,
        ));
        service.characteristics.push(CharacteristicDef::new(
            uuid_from_u16(0x2a1a),
            0x0011,
            CharPropFlags::READ,
        ));
        service.characteristics.push(CharacteristicDef::new(
            uuid_from_u16(0x2a1b),
            0,
            CharPropFlags::READ,
        ));
        let tree = AttributeTree::new(vec![service]);
        let handles: Vec<u16> = tree.services()[0]
            .characteristics
            .iter()
            .map(|c| c.handle)
            .collect();
        assert_eq!(handles, vec![0x0010, 0x0011, 0x0012]);
    }

    #[test]
    fn service_changed_lookup() {
        let mut gatt = ServiceDef::new(GATT_SERVICE);
        gatt.characteristics.push(CharacteristicDef::new(
            SERVICE_CHANGED,
            0x0003,
            CharPropFlags::INDICATE,
        ));
        let tree = AttributeTree::new(vec![gatt]);
        assert_eq!(tree.service_changed_handle(), Some(0x0003));
        assert!(tree.exposed().service_changed_handle().is_none());
    }

    #[test]
    fn well_known_names() {
        assert_eq!(common_name(uuid_from_u16(0x180f)), Some("Battery Service"));
        assert_eq!(common_name(uuid_from_u16(0xfd50)), None);
    }
}
