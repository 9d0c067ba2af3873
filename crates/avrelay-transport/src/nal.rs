//! H.264 framing: Annex B byte streams and AVCC length-prefixed units.
//!
//! Encoders and decoders here speak Annex B (start codes). FLV carries
//! AVCC: every NAL unit prefixed with its length, plus an AVC decoder
//! configuration record (the sequence header) describing SPS/PPS.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::TransportError;
use crate::TransportResult;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            other => Self::Other(other),
        }
    }
}

/// One NAL unit, header byte included, start code or length excluded.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    pub data: Bytes,
}

impl NalUnit {
    fn new(data: Bytes) -> Option<Self> {
        let header = *data.first()?;
        Some(Self {
            nal_type: NalUnitType::from(header),
            data,
        })
    }

    /// Parameter sets and delimiters travel in the sequence header instead.
    fn is_out_of_band(&self) -> bool {
        matches!(
            self.nal_type,
            NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
        )
    }
}

/// Position and length of the start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Split an Annex B byte stream into NAL units.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let Some((first, len)) = find_start_code(data, 0) else {
        return nals;
    };

    let mut start = first + len;
    loop {
        let next = find_start_code(data, start);
        let end = next.map_or(data.len(), |(pos, _)| pos);
        if let Some(nal) = NalUnit::new(Bytes::copy_from_slice(&data[start..end])) {
            nals.push(nal);
        }
        match next {
            Some((pos, len)) => start = pos + len,
            None => break,
        }
    }
    nals
}

/// Split an AVCC buffer with `length_size`-byte prefixes into NAL units.
pub fn parse_avcc(data: &[u8], length_size: usize) -> TransportResult<Vec<NalUnit>> {
    if !(1..=4).contains(&length_size) {
        return Err(TransportError::Protocol(format!(
            "invalid NAL length size {length_size}"
        )));
    }

    let mut buf = data;
    let mut nals = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < length_size {
            return Err(TransportError::Protocol("truncated NAL length".into()));
        }
        let len = buf.get_uint(length_size) as usize;
        if buf.remaining() < len {
            return Err(TransportError::Protocol(format!(
                "NAL of {len} bytes overruns {} remaining",
                buf.remaining()
            )));
        }
        if let Some(nal) = NalUnit::new(Bytes::copy_from_slice(&buf[..len])) {
            nals.push(nal);
        }
        buf.advance(len);
    }
    Ok(nals)
}

/// Annex B access unit to AVCC with 4-byte lengths, dropping in-band
/// parameter sets and delimiters.
pub fn annex_b_to_avcc(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    for nal in parse_annex_b(data).iter().filter(|nal| !nal.is_out_of_band()) {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// NAL units back to an Annex B byte stream.
pub fn to_annex_b(nals: &[NalUnit]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nals.iter().map(|n| n.data.len() + 4).sum());
    for nal in nals {
        buf.put_slice(&START_CODE);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// Whether an Annex B access unit carries an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    parse_annex_b(data)
        .iter()
        .any(|nal| nal.nal_type == NalUnitType::IdrSlice)
}

/// AVC decoder configuration record (ISO 14496-15), the FLV sequence header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfig {
    /// Build from Annex B SPS/PPS as produced by the encoder.
    pub fn from_annex_b(headers: &[u8]) -> Option<Self> {
        let nals = parse_annex_b(headers);
        let sps: Vec<Bytes> = nals
            .iter()
            .filter(|n| n.nal_type == NalUnitType::Sps)
            .map(|n| n.data.clone())
            .collect();
        let pps: Vec<Bytes> = nals
            .iter()
            .filter(|n| n.nal_type == NalUnitType::Pps)
            .map(|n| n.data.clone())
            .collect();

        let first = sps.first()?;
        if first.len() < 4 || pps.is_empty() {
            debug!(sps = sps.len(), pps = pps.len(), "Incomplete parameter sets");
            return None;
        }

        Some(Self {
            profile: first[1],
            compatibility: first[2],
            level: first[3],
            length_size: 4,
            sps,
            pps,
        })
    }

    /// Parse a record received in a sequence header.
    pub fn parse(data: &[u8]) -> TransportResult<Self> {
        let truncated = || TransportError::Protocol("truncated AVC decoder configuration".into());
        let mut buf = data;
        if buf.remaining() < 6 {
            return Err(truncated());
        }

        let version = buf.get_u8();
        if version != 1 {
            return Err(TransportError::Protocol(format!(
                "AVC configuration version {version}"
            )));
        }
        let profile = buf.get_u8();
        let compatibility = buf.get_u8();
        let level = buf.get_u8();
        let length_size = (buf.get_u8() & 0x03) as usize + 1;

        let read_sets = |count: usize, buf: &mut &[u8]| -> TransportResult<Vec<Bytes>> {
            let mut sets = Vec::with_capacity(count);
            for _ in 0..count {
                if buf.remaining() < 2 {
                    return Err(truncated());
                }
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    return Err(truncated());
                }
                sets.push(Bytes::copy_from_slice(&buf[..len]));
                buf.advance(len);
            }
            Ok(sets)
        };

        let sps_count = (buf.get_u8() & 0x1F) as usize;
        let sps = read_sets(sps_count, &mut buf)?;
        if buf.remaining() < 1 {
            return Err(truncated());
        }
        let pps_count = buf.get_u8() as usize;
        let pps = read_sets(pps_count, &mut buf)?;

        Ok(Self {
            profile,
            compatibility,
            level,
            length_size,
            sps,
            pps,
        })
    }

    /// Serialize the record.
    pub fn to_bytes(&self) -> Bytes {
        let sets: usize = self.sps.iter().chain(&self.pps).map(|s| s.len() + 2).sum();
        let mut buf = BytesMut::with_capacity(7 + sets);

        buf.put_u8(0x01);
        buf.put_u8(self.profile);
        buf.put_u8(self.compatibility);
        buf.put_u8(self.level);
        // Upper six bits reserved as ones.
        buf.put_u8(0xFC | (self.length_size.saturating_sub(1) as u8 & 0x03));
        // Upper three bits reserved as ones.
        buf.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F));
        for sps in &self.sps {
            buf.put_u16(sps.len() as u16);
            buf.put_slice(sps);
        }
        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            buf.put_u16(pps.len() as u16);
            buf.put_slice(pps);
        }

        buf.freeze()
    }

    /// SPS and PPS as an Annex B byte stream, the decoder's extradata.
    pub fn to_annex_b(&self) -> Bytes {
        let nals: Vec<NalUnit> = self
            .sps
            .iter()
            .chain(&self.pps)
            .filter_map(|set| NalUnit::new(set.clone()))
            .collect();
        to_annex_b(&nals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x42, 0xC0, 0x1E, 0xAB, 0xCD];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn headers() -> Vec<u8> {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(&SPS);
        data.extend_from_slice(&[0, 0, 1]);
        data.extend_from_slice(&PPS);
        data
    }

    #[test]
    fn test_parse_annex_b_mixed_start_codes() {
        let nals = parse_annex_b(&headers());
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].nal_type, NalUnitType::Sps);
        assert_eq!(nals[0].data.as_ref(), &SPS);
        assert_eq!(nals[1].nal_type, NalUnitType::Pps);
        assert_eq!(nals[1].data.as_ref(), &PPS);
    }

    #[test]
    fn test_annex_b_to_avcc_drops_parameter_sets() {
        let mut au = headers();
        au.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);

        let avcc = annex_b_to_avcc(&au);
        assert_eq!(avcc.as_ref(), &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x84]);
        assert!(contains_idr(&au));
    }

    #[test]
    fn test_avcc_back_to_annex_b() {
        let nals = parse_avcc(&[0, 0, 0, 2, 0x41, 0x9A, 0, 0, 0, 1, 0x06], 4).unwrap();
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].nal_type, NalUnitType::NonIdrSlice);
        assert_eq!(
            to_annex_b(&nals).as_ref(),
            &[0, 0, 0, 1, 0x41, 0x9A, 0, 0, 0, 1, 0x06]
        );
    }

    #[test]
    fn test_truncated_avcc_is_protocol_error() {
        assert!(parse_avcc(&[0, 0, 0, 9, 0x41], 4).is_err());
        assert!(parse_avcc(&[0, 0], 4).is_err());
    }

    #[test]
    fn test_decoder_config_record() {
        let config = AvcDecoderConfig::from_annex_b(&headers()).unwrap();
        let record = config.to_bytes();

        assert_eq!(record[0], 0x01);
        assert_eq!(record[1], 0x42);
        assert_eq!(record[2], 0xC0);
        assert_eq!(record[3], 0x1E);
        assert_eq!(record[4], 0xFF);
        assert_eq!(record[5], 0xE1);

        let parsed = AvcDecoderConfig::parse(&record).unwrap();
        assert_eq!(parsed, config);

        let mut expected = vec![0, 0, 0, 1];
        expected.extend_from_slice(&SPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&PPS);
        assert_eq!(parsed.to_annex_b().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_headers_without_pps_rejected() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(&SPS);
        assert!(AvcDecoderConfig::from_annex_b(&data).is_none());
    }
}
