//! GATT property and permission bitsets
//!
//! Capability checks are pure functions over these bitsets and run before anything is
//! submitted to the correlator.

use serde::{Deserialize, Serialize};
use std::fmt;

bitflags::bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags::bitflags! {
    /// Attribute permissions declared by a characteristic or descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttributePermissions: u16 {
        const READ = 0x0001;
        const READ_ENCRYPTED = 0x0002;
        const READ_AUTHENTICATED = 0x0004;
        const WRITE = 0x0010;
        const WRITE_ENCRYPTED = 0x0020;
        const WRITE_AUTHENTICATED = 0x0040;
        const WRITE_SIGNED = 0x0080;
        const WRITE_SIGNED_AUTHENTICATED = 0x0100;
    }
}

impl AttributePermissions {
    pub fn readable(&self) -> bool {
        self.intersects(Self::READ | Self::READ_ENCRYPTED | Self::READ_AUTHENTICATED)
    }

    pub fn writable(&self) -> bool {
        self.intersects(
            Self::WRITE
                | Self::WRITE_ENCRYPTED
                | Self::WRITE_AUTHENTICATED
                | Self::WRITE_SIGNED
                | Self::WRITE_SIGNED_AUTHENTICATED,
        )
    }
}

/// How a characteristic value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
    Signed,
}

impl WriteType {
    fn required_property(&self) -> CharacteristicProperties {
        match self {
            WriteType::WithResponse => CharacteristicProperties::WRITE,
            WriteType::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            WriteType::Signed => CharacteristicProperties::SIGNED_WRITE,
        }
    }

    /// Pick the write type a characteristic supports, preferring acknowledged writes
    pub fn preferred_for(properties: CharacteristicProperties) -> Option<WriteType> {
        [WriteType::WithResponse, WriteType::WithoutResponse, WriteType::Signed]
            .into_iter()
            .find(|write_type| properties.contains(write_type.required_property()))
    }
}

/// Capability requested from a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write(WriteType),
    Listen,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Read => f.write_str("read"),
            Capability::Write(write_type) => write!(f, "write ({:?})", write_type),
            Capability::Listen => f.write_str("listen"),
        }
    }
}

/// Check a characteristic's property bitset against the requested capability
pub fn supports(properties: CharacteristicProperties, capability: Capability) -> bool {
    match capability {
        Capability::Read => properties.contains(CharacteristicProperties::READ),
        Capability::Write(write_type) => properties.contains(write_type.required_property()),
        Capability::Listen => properties
            .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE),
    }
}

/// Descriptor permissions are often unknown on the client side; empty means unrestricted
pub fn descriptor_supports(permissions: AttributePermissions, capability: Capability) -> bool {
    if permissions.is_empty() {
        return true;
    }
    match capability {
        Capability::Read => permissions.readable(),
        Capability::Write(_) => permissions.writable(),
        Capability::Listen => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_requires_read_flag() {
        assert!(supports(CharacteristicProperties::READ, Capability::Read));
        assert!(!supports(CharacteristicProperties::WRITE, Capability::Read));
    }

    #[test]
    fn test_write_type_matches_flag() {
        let props = CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert!(supports(props, Capability::Write(WriteType::WithoutResponse)));
        assert!(!supports(props, Capability::Write(WriteType::WithResponse)));
        assert!(!supports(props, Capability::Write(WriteType::Signed)));
    }

    #[test]
    fn test_listen_accepts_notify_or_indicate() {
        assert!(supports(CharacteristicProperties::NOTIFY, Capability::Listen));
        assert!(supports(CharacteristicProperties::INDICATE, Capability::Listen));
        assert!(!supports(CharacteristicProperties::READ, Capability::Listen));
    }

    #[test]
    fn test_preferred_write_type() {
        let both = CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert_eq!(WriteType::preferred_for(both), Some(WriteType::WithResponse));
        assert_eq!(
            WriteType::preferred_for(CharacteristicProperties::WRITE_WITHOUT_RESPONSE),
            Some(WriteType::WithoutResponse)
        );
        assert_eq!(WriteType::preferred_for(CharacteristicProperties::READ), None);
    }

    #[test]
    fn test_descriptor_permissions() {
        assert!(descriptor_supports(AttributePermissions::empty(), Capability::Read));
        assert!(descriptor_supports(AttributePermissions::READ_ENCRYPTED, Capability::Read));
        assert!(!descriptor_supports(
            AttributePermissions::READ,
            Capability::Write(WriteType::WithResponse)
        ));
    }
}
