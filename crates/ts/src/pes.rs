//! PES header timestamp extraction.

/// Parse a 33-bit PTS or DTS from its 5-byte encoding.
///
/// Layout: `[marker(4) | ts32..30 | 1 | ts29..15 | 1 | ts14..0 | 1]`
fn parse_timestamp(data: &[u8]) -> u64 {
    (((data[0] as u64 >> 1) & 0x07) << 30)
        | ((data[1] as u64) << 22)
        | (((data[2] as u64 >> 1) & 0x7F) << 15)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64 >> 1) & 0x7F)
}

/// Check if a stream_id carries the optional PES header (PTS/DTS fields).
///
/// Per ISO 13818-1 Table 2-18, these stream IDs do NOT:
fn has_optional_pes_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        0xBC   // program_stream_map
        | 0xBE // padding_stream
        | 0xBF // private_stream_2
        | 0xF0 // ECM_stream
        | 0xF1 // EMM_stream
        | 0xFF // program_stream_directory
        | 0xF2 // DSMCC_stream
        | 0xF8 // ITU-T Rec. H.222.1 type E
    )
}

fn pts_dts_flags(payload: &[u8]) -> Option<u8> {
    if payload.len() < 9
        || payload[0] != 0x00
        || payload[1] != 0x00
        || payload[2] != 0x01
        || !has_optional_pes_header(payload[3])
    {
        return None;
    }
    Some((payload[7] >> 6) & 0x03)
}

/// Extract the PTS from a payload starting with a PES header, if present.
pub fn pts_from_payload(payload: &[u8]) -> Option<u64> {
    let flags = pts_dts_flags(payload)?;
    if flags & 0b10 == 0 || payload.len() < 14 {
        return None;
    }
    Some(parse_timestamp(&payload[9..14]))
}

/// Extract the DTS from a payload starting with a PES header, if present.
pub fn dts_from_payload(payload: &[u8]) -> Option<u64> {
    let flags = pts_dts_flags(payload)?;
    if flags != 0b11 || payload.len() < 19 {
        return None;
    }
    Some(parse_timestamp(&payload[14..19]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pes_with_pts_dts(pts: u64, dts: u64) -> Vec<u8> {
        let mut p = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0xC0, 0x0A];
        for (marker, ts) in [(0x31u8, pts), (0x11u8, dts)] {
            p.push(marker | (((ts >> 30) as u8 & 0x07) << 1));
            p.push((ts >> 22) as u8);
            p.push(0x01 | (((ts >> 15) as u8 & 0x7F) << 1));
            p.push((ts >> 7) as u8);
            p.push(0x01 | (((ts & 0x7F) as u8) << 1));
        }
        p
    }

    #[test]
    fn test_pts_and_dts() {
        let payload = pes_with_pts_dts(90_000, 87_000);
        assert_eq!(pts_from_payload(&payload), Some(90_000));
        assert_eq!(dts_from_payload(&payload), Some(87_000));
    }

    #[test]
    fn test_no_start_code() {
        let payload = [0xFFu8; 32];
        assert!(pts_from_payload(&payload).is_none());
        assert!(dts_from_payload(&payload).is_none());
    }

    #[test]
    fn test_padding_stream_has_no_timestamps() {
        let mut payload = pes_with_pts_dts(90_000, 87_000);
        payload[3] = 0xBE;
        assert!(pts_from_payload(&payload).is_none());
    }
}
