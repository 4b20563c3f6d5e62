//! Handshake metadata properties.
//!
//! Wire format, repeated for each property:
//!
//! ```text
//! +----------+------+---------------+-------+
//! | name len | name | value len (BE)| value |
//! |  1 byte  |  N   |    4 bytes    |   M   |
//! +----------+------+---------------+-------+
//! ```

use crate::error::{ProtocolError, Result};

/// Property name carrying the sender's socket type.
pub const SOCKET_TYPE: &str = "Socket-Type";

/// Property name carrying the sender's routing identity.
pub const IDENTITY: &str = "Identity";

/// Ordered list of metadata properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    properties: Vec<(String, Vec<u8>)>,
}

impl Metadata {
    /// Create an empty property list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property. Names must be 1..=255 bytes of ASCII.
    pub fn insert(&mut self, name: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        validate_name(name)?;
        let value = value.into();
        if u32::try_from(value.len()).is_err() {
            return Err(ProtocolError::InvalidMetadata(format!(
                "value of {} is too long",
                name
            )));
        }
        self.properties.push((name.to_string(), value));
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: &str, value: impl Into<Vec<u8>>) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Look up a property by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether there are no properties.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.properties
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let size = self
            .properties
            .iter()
            .map(|(name, value)| 1 + name.len() + 4 + value.len())
            .sum();
        let mut out = Vec::with_capacity(size);
        for (name, value) in &self.properties {
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    /// Parse from wire format.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let mut metadata = Self::new();
        while !bytes.is_empty() {
            let name_len = bytes[0] as usize;
            bytes = &bytes[1..];
            if bytes.len() < name_len {
                return Err(ProtocolError::InvalidMetadata("truncated name".to_string()));
            }
            let name = std::str::from_utf8(&bytes[..name_len])
                .map_err(|_| ProtocolError::InvalidMetadata("name is not ASCII".to_string()))?;
            validate_name(name)?;
            bytes = &bytes[name_len..];

            if bytes.len() < 4 {
                return Err(ProtocolError::InvalidMetadata(
                    "truncated value length".to_string(),
                ));
            }
            let value_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            bytes = &bytes[4..];
            if bytes.len() < value_len {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "truncated value of {}",
                    name
                )));
            }
            metadata
                .properties
                .push((name.to_string(), bytes[..value_len].to_vec()));
            bytes = &bytes[value_len..];
        }
        Ok(metadata)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > u8::MAX as usize {
        return Err(ProtocolError::InvalidMetadata(format!(
            "name length {} out of range",
            name.len()
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(ProtocolError::InvalidMetadata(format!(
            "name {:?} is not printable ASCII",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let metadata = Metadata::new().with(SOCKET_TYPE, "DEALER").unwrap();
        let encoded = metadata.encode();
        assert_eq!(encoded[0], 11);
        assert_eq!(&encoded[1..12], b"Socket-Type");
        assert_eq!(&encoded[12..16], &[0, 0, 0, 6]);
        assert_eq!(&encoded[16..], b"DEALER");
    }

    #[test]
    fn test_decode_multiple_properties() {
        let metadata = Metadata::new()
            .with(SOCKET_TYPE, "ROUTER")
            .unwrap()
            .with(IDENTITY, vec![0u8, 1, 2])
            .unwrap();
        let decoded = Metadata::decode(&metadata.encode()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get("socket-type"), Some(&b"ROUTER"[..]));
        assert_eq!(decoded.get(IDENTITY), Some(&[0u8, 1, 2][..]));
    }

    #[test]
    fn test_decode_empty() {
        assert!(Metadata::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_truncated_value() {
        let mut encoded = Metadata::new().with(SOCKET_TYPE, "PUB").unwrap().encode();
        encoded.pop();
        assert!(matches!(
            Metadata::decode(&encoded),
            Err(ProtocolError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_decode_zero_length_name() {
        assert!(Metadata::decode(&[0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_insert_rejects_bad_names() {
        let mut metadata = Metadata::new();
        assert!(metadata.insert("", "x").is_err());
        assert!(metadata.insert("has space", "x").is_err());
        assert!(metadata.insert(&"n".repeat(256), "x").is_err());
        assert!(metadata.insert(&"n".repeat(255), "x").is_ok());
    }

    #[test]
    fn test_iter_keeps_insertion_order() {
        let metadata = Metadata::new()
            .with("B", "2")
            .unwrap()
            .with("A", "1")
            .unwrap();
        let names: Vec<&str> = metadata.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["B", "A"]);
    }
}
