use pvwire_frame::{Command, FrameError, RequestEncoder, Result, WireReader, WireWriter};

/// Rights bits.
pub mod rights {
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
}

/// Payload size: channel id and one rights byte.
pub const PAYLOAD_SIZE: usize = 5;

/// Server notification that the client's rights on a channel changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRightsChange {
    pub cid: u32,
    pub rights: u8,
}

impl AccessRightsChange {
    pub fn new(cid: u32, rights: u8) -> Self {
        Self { cid, rights }
    }

    pub fn can_read(&self) -> bool {
        self.rights & rights::READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.rights & rights::WRITE != 0
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        if r.remaining() < PAYLOAD_SIZE {
            return Err(FrameError::malformed(
                "access rights change",
                format!("{} byte payload, need {PAYLOAD_SIZE}", r.remaining()),
            ));
        }
        Ok(Self {
            cid: r.get_u32()?,
            rights: r.get_u8()?,
        })
    }
}

impl RequestEncoder for AccessRightsChange {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::AclChange.code());
        w.put_u32(self.cid);
        w.put_u8(self.rights);
        w.end_message(mark)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, Header, HEADER_SIZE};

    use super::*;

    #[test]
    fn five_byte_payload() {
        let change = AccessRightsChange::new(0x0102_0304, rights::READ);
        let mut buf = BytesMut::new();
        change
            .encode_request(2, &mut WireWriter::new(&mut buf, ByteOrder::Big))
            .expect("encode");
        let header = Header::decode(&buf).expect("header");
        assert_eq!(header.payload_size as usize, PAYLOAD_SIZE);
        assert_eq!(&buf[HEADER_SIZE..], &[1, 2, 3, 4, rights::READ]);

        let decoded = AccessRightsChange::decode(&mut WireReader::new(&buf[HEADER_SIZE..], header.order()))
            .expect("decode");
        assert_eq!(decoded, change);
        assert!(decoded.can_read());
        assert!(!decoded.can_write());
    }

    #[test]
    fn short_payload_is_malformed() {
        let err = AccessRightsChange::decode(&mut WireReader::new(&[0, 0, 1], ByteOrder::Big))
            .expect_err("too short");
        assert!(matches!(err, FrameError::Malformed { .. }));
    }
}
