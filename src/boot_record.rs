//! Measured boot record carried in the BOOT_RECORD TLV.
//!
//! The record is a CBOR map of software component properties. The
//! measurement value is a zero placeholder of the digest length and must be
//! the last entry: the bootloader patches the final bytes of the record with
//! the measured image digest at boot.

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_cbor::Value;

use crate::{ImageError, ImageVersion, Result};

/// Longest accepted software type string.
pub const MAX_SW_TYPE_LENGTH: usize = 12;

// Software component property keys.
const SW_TYPE: u8 = 1;
const SW_MEASUREMENT_VALUE: u8 = 2;
const SW_VERSION: u8 = 4;
const SW_SIGNER_ID: u8 = 5;
const SW_MEASUREMENT_DESCRIPTION: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRecord {
    pub sw_type: String,
    pub version: ImageVersion,
    /// Hash of the signing public key, or zeroes for unsigned images.
    pub signer_id: Vec<u8>,
    /// Name of the digest TLV, e.g. `"SHA256"`.
    pub measurement_description: String,
    /// Length of the measurement placeholder (the digest length).
    pub measurement_len: usize,
}

impl BootRecord {
    pub fn new(
        sw_type: &str,
        version: ImageVersion,
        signer_id: Vec<u8>,
        measurement_description: &str,
        measurement_len: usize,
    ) -> Result<Self> {
        if sw_type.len() > MAX_SW_TYPE_LENGTH {
            return Err(ImageError::SwTypeTooLong(sw_type.to_string()));
        }
        Ok(Self {
            sw_type: sw_type.to_string(),
            version,
            signer_id,
            measurement_description: measurement_description.to_string(),
            measurement_len,
        })
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self)
            .map_err(|e| ImageError::Usage(format!("failed to encode boot record: {e}")))
    }
}

impl Serialize for BootRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry(&SW_TYPE, &self.sw_type)?;
        map.serialize_entry(&SW_VERSION, &self.version.short_string())?;
        map.serialize_entry(&SW_SIGNER_ID, &Value::Bytes(self.signer_id.clone()))?;
        map.serialize_entry(&SW_MEASUREMENT_DESCRIPTION, &self.measurement_description)?;
        map.serialize_entry(
            &SW_MEASUREMENT_VALUE,
            &Value::Bytes(vec![0u8; self.measurement_len]),
        )?;
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record() -> BootRecord {
        BootRecord::new("NSPE", ImageVersion::new(1, 2, 3, 4), vec![0xab; 32], "SHA256", 32)
            .unwrap()
    }

    #[test]
    fn decodes_as_property_map() {
        let bytes = record().to_cbor().unwrap();
        let value: Value = serde_cbor::from_slice(&bytes).unwrap();
        let Value::Map(map) = value else {
            panic!("boot record is not a map");
        };
        let get = |k: i128| map.get(&Value::Integer(k)).cloned();

        let mut expected = BTreeMap::new();
        expected.insert(1, Value::Text("NSPE".into()));
        expected.insert(2, Value::Bytes(vec![0; 32]));
        expected.insert(4, Value::Text("1.2.3".into()));
        expected.insert(5, Value::Bytes(vec![0xab; 32]));
        expected.insert(6, Value::Text("SHA256".into()));
        assert_eq!(map.len(), expected.len());
        for (k, v) in expected {
            assert_eq!(get(k), Some(v), "property {k}");
        }
    }

    #[test]
    fn measurement_is_last() {
        let bytes = record().to_cbor().unwrap();
        // key 2, byte string of 32 (0x58 0x20), then 32 zero bytes.
        let tail = &bytes[bytes.len() - 35..];
        assert_eq!(&tail[..3], &[0x02, 0x58, 0x20]);
        assert!(tail[3..].iter().all(|&b| b == 0));
        // Map header with 5 entries, first key is 1.
        assert_eq!(&bytes[..2], &[0xa5, 0x01]);
    }

    #[test]
    fn sw_type_length_limited() {
        assert!(BootRecord::new("123456789012", ImageVersion::default(), vec![], "SHA256", 32).is_ok());
        assert!(matches!(
            BootRecord::new("1234567890123", ImageVersion::default(), vec![], "SHA256", 32),
            Err(ImageError::SwTypeTooLong(_))
        ));
    }
}
