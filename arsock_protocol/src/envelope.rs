use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

/// Size in bytes of the routing frame that leads every message.
pub const ROUTING_ID_LEN: usize = 8;

/// Routing id carried by requests that expect no reply. Replies tagged with
/// it are dropped on arrival.
pub const NO_ROUTE: u64 = 0;

pub fn encode_routing_id(id: u64) -> Bytes {
    let mut buf = [0u8; ROUTING_ID_LEN];
    BigEndian::write_u64(&mut buf, id);
    Bytes::copy_from_slice(&buf)
}

/// Reads a routing id from a frame. Frames of any other length are not
/// routing frames.
pub fn decode_routing_id(frame: &[u8]) -> Option<u64> {
    if frame.len() != ROUTING_ID_LEN {
        return None;
    }
    Some(BigEndian::read_u64(frame))
}

/// Prepends the routing frame to an outbound payload.
pub fn wrap(id: u64, payload: Vec<Bytes>) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(payload.len() + 1);
    frames.push(encode_routing_id(id));
    frames.extend(payload);
    frames
}

/// Splits an inbound message into its routing id and the remaining frames.
pub fn unwrap(mut frames: Vec<Bytes>) -> Option<(u64, Vec<Bytes>)> {
    if frames.is_empty() {
        return None;
    }
    let id = decode_routing_id(&frames[0])?;
    frames.remove(0);
    Some((id, frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_id_is_big_endian() {
        let frame = encode_routing_id(1234567890);
        assert_eq!(&[0, 0, 0, 0, 73, 150, 2, 210], &frame[..]);
        assert_eq!(Some(1234567890), decode_routing_id(&frame));
    }

    #[test]
    fn wrap_then_unwrap_keeps_payload() {
        let payload = vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")];
        let frames = wrap(7, payload.clone());
        assert_eq!(3, frames.len());
        assert_eq!(Some((7, payload)), unwrap(frames));
    }

    #[test]
    fn malformed_messages_have_no_route() {
        assert_eq!(None, unwrap(Vec::new()));
        assert_eq!(None, unwrap(vec![Bytes::from_static(b"short")]));
    }
}
