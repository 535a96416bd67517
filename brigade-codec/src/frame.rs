//! Length-prefixed multi-packet blob used on both legs of the wire:
//! `[count:u8]` then, per packet, a big-endian `u16` length and the payload.

use crate::error::CodecError;

/// Packs a batch of sub-packets into one blob. Packet lengths must fit in
/// 16 bits; Opus frames at 60 ms are far below that.
pub fn pack_multi(packets: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = packets.iter().map(|p| 2 + p.len()).sum();
    let mut out = Vec::with_capacity(1 + total);
    out.push(packets.len() as u8);
    for packet in packets {
        out.push((packet.len() >> 8) as u8);
        out.push((packet.len() & 0xff) as u8);
        out.extend_from_slice(packet);
    }
    out
}

/// Reverses [`pack_multi`]. Fails with `MalformedFrame` when a length header
/// or payload runs past the end of the blob.
pub fn unpack_multi(data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let (&count, mut rest) = data
        .split_first()
        .ok_or(CodecError::MalformedFrame { offset: 0 })?;
    let mut offset = 1usize;
    let mut packets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < 2 {
            return Err(CodecError::MalformedFrame { offset });
        }
        let length = ((rest[0] as usize) << 8) | rest[1] as usize;
        rest = &rest[2..];
        offset += 2;
        if rest.len() < length {
            return Err(CodecError::MalformedFrame { offset });
        }
        packets.push(rest[..length].to_vec());
        rest = &rest[length..];
        offset += length;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let packets = vec![vec![0xab], vec![], vec![1, 2, 3, 4, 5]];
        assert_eq!(unpack_multi(&pack_multi(&packets)).unwrap(), packets);
    }

    #[test]
    fn matches_wire_layout() {
        // [count][len_hi][len_lo][payload]*, big-endian lengths.
        let blob = pack_multi(&[vec![0xaa], vec![0xbb, 0xcc]]);
        assert_eq!(blob, vec![2, 0, 1, 0xaa, 0, 2, 0xbb, 0xcc]);
    }

    #[test]
    fn empty_batch_is_a_single_zero_byte() {
        assert_eq!(pack_multi(&[]), vec![0]);
        assert!(unpack_multi(&[0]).unwrap().is_empty());
    }

    #[test]
    fn long_packet_length_uses_both_bytes() {
        let packet = vec![7u8; 300];
        let blob = pack_multi(std::slice::from_ref(&packet));
        assert_eq!(blob[1], 1);
        assert_eq!(blob[2], 44);
        assert_eq!(unpack_multi(&blob).unwrap(), vec![packet]);
    }

    #[test]
    fn truncated_inputs_fail() {
        assert!(matches!(
            unpack_multi(&[]),
            Err(CodecError::MalformedFrame { offset: 0 })
        ));
        // Count promises a packet but the length header is cut short.
        assert!(unpack_multi(&[1, 0]).is_err());
        // Length promises two bytes but only one follows.
        assert!(unpack_multi(&[1, 0, 2, 0xaa]).is_err());
    }
}
