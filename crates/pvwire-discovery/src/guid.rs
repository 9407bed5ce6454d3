use std::fmt;

use pvwire_frame::{Result, WireReader, WireWriter};
use rand::RngCore;
use serde::{Serialize, Serializer};

/// Size of a server identifier on the wire.
pub const GUID_SIZE: usize = 12;

/// Server identifier.
///
/// Lets clients recognize the same server when its replies and beacons
/// arrive through several network interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid([u8; GUID_SIZE]);

impl Guid {
    pub const fn new(bytes: [u8; GUID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; GUID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GUID_SIZE] {
        &self.0
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self(r.get_array()?))
    }

    pub fn encode(&self, w: &mut WireWriter<'_>) {
        w.put_bytes(&self.0);
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::ByteOrder;

    use super::*;

    #[test]
    fn displays_as_hex() {
        let guid = Guid::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xAB, 0xCD]);
        assert_eq!(guid.to_string(), "0x00010203040506070809ABCD");
    }

    #[test]
    fn wire_form_is_raw_bytes() {
        let guid = Guid::random();
        let mut buf = BytesMut::new();
        guid.encode(&mut WireWriter::new(&mut buf, ByteOrder::Little));
        assert_eq!(&buf[..], guid.as_bytes());
        let decoded = Guid::decode(&mut WireReader::new(&buf, ByteOrder::Big)).expect("decode");
        assert_eq!(decoded, guid);
    }

    #[test]
    fn random_guids_differ() {
        assert_ne!(Guid::random(), Guid::random());
    }
}
