use pvwire_frame::{ControlCommand, ControlMessage};

/// First message of a server: announces the byte order it sends in.
///
/// The order travels in the header flags; the size field is unused.
pub fn set_byte_order() -> ControlMessage {
    ControlMessage {
        command: ControlCommand::SetByteOrder.code(),
        data: 0,
    }
}

/// Liveness probe; the peer answers with [`echo_response`] carrying `token`.
pub fn echo_request(token: u32) -> ControlMessage {
    ControlMessage {
        command: ControlCommand::EchoRequest.code(),
        data: token,
    }
}

pub fn echo_response(token: u32) -> ControlMessage {
    ControlMessage {
        command: ControlCommand::EchoResponse.code(),
        data: token,
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, Header, RequestEncoder, WireWriter, HEADER_SIZE};

    use super::*;

    #[test]
    fn set_byte_order_carries_order_in_flags() {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::Big).with_server_origin(true);
        set_byte_order().encode_request(2, &mut w).expect("encode");

        assert_eq!(buf.len(), HEADER_SIZE);
        let header = Header::decode(&buf).expect("header");
        assert!(header.is_control());
        assert!(header.is_server());
        assert_eq!(header.order(), ByteOrder::Big);
        assert_eq!(header.command, ControlCommand::SetByteOrder.code());
    }

    #[test]
    fn echo_token_round_trips_in_size_field() {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::Little);
        echo_request(0xABCD).encode_request(2, &mut w).expect("encode");
        let header = Header::decode(&buf).expect("header");
        assert_eq!(header.payload_size, 0xABCD);
        assert_eq!(echo_response(header.payload_size).data, 0xABCD);
    }
}
