//! Device property tables.
//!
//! A device publishes an ordered sequence of `{key, reserved, value}` triples
//! when it is added. The table is frozen at that point: [`PropertyTable`] has
//! no mutating methods and clones share the same backing storage.
//!
//! # Wire format
//!
//! Each property is 12 bytes, little-endian:
//!
//! ```text
//! +--------+----------+--------+
//! | key:u32| rsvd:u32 |val:u32 |
//! +--------+----------+--------+
//! ```
//!
//! # Example
//!
//! ```
//! use ddk_io::props::{DeviceProp, PropertyTable, keys};
//!
//! let props = PropertyTable::new(vec![
//!     DeviceProp::new(keys::BIND_PCI_VID, 0x8086),
//!     DeviceProp::new(keys::BIND_PCI_DID, 0x100e),
//! ]);
//! assert_eq!(props.get(keys::BIND_PCI_VID), Some(0x8086));
//! assert_eq!(props.get(keys::BIND_USB_VID), None);
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known property keys.
pub mod keys {
    /// Protocol id of the device. Synthesized from the node when absent.
    pub const BIND_PROTOCOL: u32 = 0x0001;
    /// 1 while evaluating for automatic binding, 0 for manual requests.
    pub const BIND_AUTOBIND: u32 = 0x0002;

    pub const BIND_PCI_VID: u32 = 0x0100;
    pub const BIND_PCI_DID: u32 = 0x0101;
    pub const BIND_PCI_CLASS: u32 = 0x0102;
    pub const BIND_PCI_SUBCLASS: u32 = 0x0103;
    pub const BIND_PCI_INTERFACE: u32 = 0x0104;

    pub const BIND_USB_VID: u32 = 0x0200;
    pub const BIND_USB_PID: u32 = 0x0201;
    pub const BIND_USB_CLASS: u32 = 0x0202;

    pub const BIND_PLATFORM_DEV_VID: u32 = 0x0300;
    pub const BIND_PLATFORM_DEV_PID: u32 = 0x0301;
}

/// Size in bytes of one encoded property.
pub const PROP_WIRE_SIZE: usize = 12;

/// A single device property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceProp {
    pub key: u32,
    #[serde(default)]
    pub reserved: u32,
    pub value: u32,
}

impl DeviceProp {
    pub const fn new(key: u32, value: u32) -> Self {
        Self {
            key,
            reserved: 0,
            value,
        }
    }
}

/// Immutable, ordered property set attached to a device.
///
/// Cloning is cheap; all clones refer to the same properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyTable {
    props: Arc<[DeviceProp]>,
}

impl PropertyTable {
    /// Freeze a property sequence.
    pub fn new(props: Vec<DeviceProp>) -> Self {
        Self {
            props: props.into(),
        }
    }

    /// An empty table.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a key. The first occurrence wins when a key repeats.
    pub fn get(&self, key: u32) -> Option<u32> {
        self.props.iter().find(|p| p.key == key).map(|p| p.value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceProp> {
        self.props.iter()
    }

    pub fn as_slice(&self) -> &[DeviceProp] {
        &self.props
    }

    /// Decode a table from its wire format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `bytes` is not a whole number of
    /// 12-byte records.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % PROP_WIRE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "property table length {} is not a multiple of {}",
                bytes.len(),
                PROP_WIRE_SIZE
            )));
        }
        let props = bytes
            .chunks_exact(PROP_WIRE_SIZE)
            .map(|rec| DeviceProp {
                key: read_u32(&rec[0..4]),
                reserved: read_u32(&rec[4..8]),
                value: read_u32(&rec[8..12]),
            })
            .collect();
        Ok(Self::new(props))
    }

    /// Encode the table into its wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.props.len() * PROP_WIRE_SIZE);
        for p in self.props.iter() {
            out.extend_from_slice(&p.key.to_le_bytes());
            out.extend_from_slice(&p.reserved.to_le_bytes());
            out.extend_from_slice(&p.value.to_le_bytes());
        }
        out
    }
}

impl From<Vec<DeviceProp>> for PropertyTable {
    fn from(props: Vec<DeviceProp>) -> Self {
        Self::new(props)
    }
}

impl FromIterator<DeviceProp> for PropertyTable {
    fn from_iter<I: IntoIterator<Item = DeviceProp>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Key lookup used by the bind program evaluator.
///
/// Implemented by [`PropertyTable`] directly, and by the coordinator's view of
/// a device, which adds synthetic keys such as [`keys::BIND_PROTOCOL`].
pub trait PropertyLookup {
    fn lookup(&self, key: u32) -> Option<u32>;
}

impl PropertyLookup for PropertyTable {
    fn lookup(&self, key: u32) -> Option<u32> {
        self.get(key)
    }
}

impl PropertyLookup for [DeviceProp] {
    fn lookup(&self, key: u32) -> Option<u32> {
        self.iter().find(|p| p.key == key).map(|p| p.value)
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_wins() {
        let props = PropertyTable::new(vec![
            DeviceProp::new(7, 1),
            DeviceProp::new(7, 2),
        ]);
        assert_eq!(props.get(7), Some(1));
        assert_eq!(props.get(8), None);
    }

    #[test]
    fn test_wire_format() {
        let props = PropertyTable::new(vec![DeviceProp {
            key: 0x0102,
            reserved: 0xdead,
            value: 6,
        }]);
        let bytes = props.to_bytes();
        assert_eq!(bytes.len(), PROP_WIRE_SIZE);
        assert_eq!(&bytes[0..4], &[0x02, 0x01, 0, 0]);
        assert_eq!(PropertyTable::from_bytes(&bytes).unwrap(), props);
    }

    #[test]
    fn test_truncated_wire_rejected() {
        assert!(PropertyTable::from_bytes(&[0u8; 13]).is_err());
        assert!(PropertyTable::from_bytes(&[]).unwrap().is_empty());
    }
}
