//! RFC 6455 frame (de)serialization.
//!
//! Mirrors `PacketSerialization.cpp`: the deserializer needs the full payload
//! present before it returns `Ok` -- a header-parsed-but-payload-pending
//! frame always reports `NeedMoreData`. Staging "header parsed, payload
//! pending" across `on_data_received` calls is the session layer's job
//! (`session.rs`), not this module's.

pub type MaskingKey = [u8; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl PacketType {
    fn to_opcode(self) -> u8 {
        match self {
            PacketType::Continuation => 0,
            PacketType::Text => 1,
            PacketType::Binary => 2,
            PacketType::Close => 8,
            PacketType::Ping => 9,
            PacketType::Pong => 10,
        }
    }

    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0 => Some(PacketType::Continuation),
            1 => Some(PacketType::Text),
            2 => Some(PacketType::Binary),
            8 => Some(PacketType::Close),
            9 => Some(PacketType::Ping),
            10 => Some(PacketType::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, PacketType::Close | PacketType::Ping | PacketType::Pong)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub fin: bool,
    pub payload_size: usize,
    pub masking_key: Option<MaskingKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    NeedMoreData,
    ReservedFieldsSet,
    InvalidOpcode,
    PayloadTooLarge,
}

/// XORs `payload` in place with the 4-byte `key`, repeated to cover the
/// whole buffer. Applying it twice with the same key is the identity.
///
/// The bulk of the buffer is masked 8 bytes at a time with a widened 64-bit
/// key (the key repeated twice), falling back to a byte-at-a-time loop for
/// the unaligned tail -- the same stride the source's `mask_packet_payload`
/// uses to avoid a per-byte masking_key[i % 4] indirection on the hot path.
pub fn mask_payload(key: MaskingKey, payload: &mut [u8]) {
    let key_u32 = u32::from_le_bytes(key);
    let key_u64 = u64::from(key_u32) | (u64::from(key_u32) << 32);
    let key_bytes = key_u64.to_le_bytes();

    let (chunks, tail) = payload.split_at_mut(payload.len() - payload.len() % 8);
    for chunk in chunks.chunks_exact_mut(8) {
        for (byte, k) in chunk.iter_mut().zip(key_bytes.iter()) {
            *byte ^= k;
        }
    }
    for (i, byte) in tail.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Number of header bytes a frame with `payload_size` and `masked` would
/// need, not counting the payload itself -- used by the session layer to
/// decide whether a message fits in the remaining send-buffer budget
/// without actually serializing it.
pub fn header_overhead(payload_size: usize, masked: bool) -> usize {
    let mut size = 2;
    if payload_size > 125 {
        size += if payload_size > u16::MAX as usize { 8 } else { 2 };
    }
    if masked {
        size += 4;
    }
    size
}

pub fn serialized_packet_size(payload_size: usize, masked: bool) -> usize {
    header_overhead(payload_size, masked) + payload_size
}

/// Serializes `packet` with `payload` into `out`, masking `payload` in
/// place first if `packet.masking_key` is set. `packet.fin` controls the
/// header's FIN bit directly, so a caller can emit a fragmented sequence by
/// passing `fin: false` on every packet but the last.
pub fn serialize(packet: &Packet, payload: &mut [u8], out: &mut Vec<u8>) {
    debug_assert_eq!(payload.len(), packet.payload_size);

    let mut field1 = packet.packet_type.to_opcode();
    if packet.fin {
        field1 |= 1 << 7;
    }
    out.push(field1);

    let mut field2 = if packet.masking_key.is_some() { 1 << 7 } else { 0 };
    let payload_size = payload.len();
    if payload_size <= 125 {
        field2 |= payload_size as u8;
        out.push(field2);
    } else if payload_size <= u16::MAX as usize {
        field2 |= 126;
        out.push(field2);
        out.extend_from_slice(&(payload_size as u16).to_be_bytes());
    } else {
        field2 |= 127;
        out.push(field2);
        out.extend_from_slice(&(payload_size as u64).to_be_bytes());
    }

    if let Some(key) = packet.masking_key {
        out.extend_from_slice(&key);
        mask_payload(key, payload);
    }

    out.extend_from_slice(payload);
}

pub struct Deserialized {
    pub packet: Packet,
    pub header_size: usize,
}

/// Parses one frame from the front of `data`. Returns `Ok` only once the
/// declared payload is fully present in `data` -- a complete header with an
/// incomplete payload still reports `NeedMoreData`, matching
/// `Deserializer::deserialize` in the source.
pub fn deserialize(data: &[u8]) -> Result<Deserialized, FrameError> {
    let mut cursor = data;

    let Some((&field1, rest)) = cursor.split_first() else {
        return Err(FrameError::NeedMoreData);
    };
    cursor = rest;

    let fin = field1 & (1 << 7) != 0;
    let rsv1 = field1 & (1 << 6) != 0;
    let rsv2 = field1 & (1 << 5) != 0;
    let rsv3 = field1 & (1 << 4) != 0;
    let opcode = field1 & 0b1111;

    let Some((&field2, rest)) = cursor.split_first() else {
        return Err(FrameError::NeedMoreData);
    };
    cursor = rest;

    let masked = field2 & (1 << 7) != 0;
    let size0 = field2 & !(1 << 7);

    let payload_size: u64 = if size0 <= 125 {
        u64::from(size0)
    } else if size0 == 126 {
        if cursor.len() < 2 {
            return Err(FrameError::NeedMoreData);
        }
        let (bytes, rest) = cursor.split_at(2);
        cursor = rest;
        u64::from(u16::from_be_bytes(bytes.try_into().unwrap()))
    } else {
        if cursor.len() < 8 {
            return Err(FrameError::NeedMoreData);
        }
        let (bytes, rest) = cursor.split_at(8);
        cursor = rest;
        u64::from_be_bytes(bytes.try_into().unwrap())
    };

    let masking_key = if masked {
        if cursor.len() < 4 {
            return Err(FrameError::NeedMoreData);
        }
        let (bytes, rest) = cursor.split_at(4);
        cursor = rest;
        Some(MaskingKey::try_from(bytes).unwrap())
    } else {
        None
    };

    if payload_size > usize::MAX as u64 {
        return Err(FrameError::PayloadTooLarge);
    }
    let payload_size = payload_size as usize;

    if cursor.len() < payload_size {
        return Err(FrameError::NeedMoreData);
    }

    if rsv1 || rsv2 || rsv3 {
        return Err(FrameError::ReservedFieldsSet);
    }

    let Some(packet_type) = PacketType::from_opcode(opcode) else {
        return Err(FrameError::InvalidOpcode);
    };

    let header_size = data.len() - cursor.len();
    Ok(Deserialized { packet: Packet { packet_type, fin, payload_size, masking_key }, header_size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_xor_twice_is_identity() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let original: Vec<u8> = (0..37u8).collect();
        let mut buf = original.clone();
        mask_payload(key, &mut buf);
        mask_payload(key, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn length_encoding_boundaries() {
        for size in [0usize, 125, 126, 127, 65_535, 65_536] {
            let payload = vec![0xABu8; size];
            let packet =
                Packet { packet_type: PacketType::Binary, fin: true, payload_size: size, masking_key: None };
            let mut out = Vec::new();
            let mut payload_mut = payload.clone();
            serialize(&packet, &mut payload_mut, &mut out);

            let expected_len_bytes = if size <= 125 { 0 } else if size <= 65_535 { 2 } else { 8 };
            assert_eq!(out.len(), 2 + expected_len_bytes + size);

            let result = deserialize(&out).unwrap();
            assert_eq!(result.packet.payload_size, size);
        }
    }

    #[test]
    fn need_more_data_on_incomplete_payload() {
        let payload = vec![0u8; 200];
        let packet =
            Packet { packet_type: PacketType::Binary, fin: true, payload_size: 200, masking_key: None };
        let mut out = Vec::new();
        let mut payload_mut = payload.clone();
        serialize(&packet, &mut payload_mut, &mut out);

        let truncated = &out[..out.len() - 1];
        assert_eq!(deserialize(truncated), Err(FrameError::NeedMoreData));
    }

    #[test]
    fn rejects_reserved_bits_and_bad_opcode() {
        assert_eq!(deserialize(&[0b0111_0001, 0x00]), Err(FrameError::ReservedFieldsSet));
        assert_eq!(deserialize(&[0b1000_0011, 0x00]), Err(FrameError::InvalidOpcode));
    }

    #[test]
    fn masked_roundtrip_recovers_payload() {
        let key = [9, 8, 7, 6];
        let mut payload = b"hello websocket".to_vec();
        let original = payload.clone();
        let packet = Packet {
            packet_type: PacketType::Text,
            fin: true,
            payload_size: payload.len(),
            masking_key: Some(key),
        };
        let mut out = Vec::new();
        serialize(&packet, &mut payload, &mut out);

        let result = deserialize(&out).unwrap();
        let start = result.header_size;
        let mut recovered = out[start..start + result.packet.payload_size].to_vec();
        mask_payload(key, &mut recovered);
        assert_eq!(recovered, original);
    }
}
