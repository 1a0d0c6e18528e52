//! TDF decoding.
//!
//! [`TdfParser`] walks a block of concatenated TDF records, rebuilding the
//! absolute time of relative timestamps from the running reference.

use super::{
    decode_array_period, TdfError, TDF_ARRAY_DIFF, TDF_ARRAY_HEADER_LEN, TDF_ARRAY_MASK,
    TDF_ARRAY_TIME, TDF_HEADER_LEN, TDF_ID_LIMIT, TDF_ID_MASK, TDF_TIMESTAMP_ABSOLUTE,
    TDF_TIMESTAMP_EXTENDED_RELATIVE, TDF_TIMESTAMP_MASK, TDF_TIMESTAMP_RELATIVE, TDF_TIME_LEN,
};
use crate::time::epoch_time_from;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdfDataType {
    Single,
    TimeArray,
    /// Base record followed by `tdf_num` bytes of field diffs.
    DiffArray,
}

/// One decoded record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdfParsed<'a> {
    pub tdf_id: u16,
    pub tdf_len: u8,
    pub tdf_num: u8,
    /// Absolute epoch time of the first record, `0` when untimed.
    pub time: u64,
    /// Inter-sample period in epoch ticks.
    pub period: u32,
    pub data_type: TdfDataType,
    pub data: &'a [u8],
}

impl<'a> TdfParsed<'a> {
    /// Payload of the `idx`'th record of a time array.
    pub fn record(&self, idx: usize) -> Option<&'a [u8]> {
        if self.data_type == TdfDataType::DiffArray || idx >= self.tdf_num as usize {
            return None;
        }
        let len = self.tdf_len as usize;
        self.data.get(idx * len..(idx + 1) * len)
    }
}

/// Iterator over the TDF records in a buffer.
#[derive(Debug, Clone)]
pub struct TdfParser<'a> {
    time: u64,
    buf: &'a [u8],
}

impl<'a> TdfParser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { time: 0, buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TdfError> {
        if self.buf.len() < n {
            return Err(TdfError::Malformed("record truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Decode the next record, `Ok(None)` once the buffer is exhausted.
    pub fn next_tdf(&mut self) -> Result<Option<TdfParsed<'a>>, TdfError> {
        if self.buf.len() <= TDF_HEADER_LEN {
            return Ok(None);
        }
        let header = self.take(TDF_HEADER_LEN)?;
        let id_flags = u16::from_le_bytes([header[0], header[1]]);
        let tdf_len = header[2];
        let tdf_id = id_flags & TDF_ID_MASK;
        if tdf_id == 0 || tdf_id == TDF_ID_LIMIT {
            return Err(TdfError::InvalidId(tdf_id));
        }

        let time = match id_flags & TDF_TIMESTAMP_MASK {
            TDF_TIMESTAMP_ABSOLUTE => {
                let t = self.take(TDF_TIME_LEN)?;
                let seconds = u32::from_le_bytes([t[0], t[1], t[2], t[3]]);
                let subseconds = u16::from_le_bytes([t[4], t[5]]);
                self.time = epoch_time_from(seconds as u64, subseconds);
                self.time
            }
            TDF_TIMESTAMP_RELATIVE => {
                let t = self.take(2)?;
                if self.time == 0 {
                    return Err(TdfError::Malformed("relative timestamp without reference"));
                }
                self.time += u16::from_le_bytes([t[0], t[1]]) as u64;
                self.time
            }
            TDF_TIMESTAMP_EXTENDED_RELATIVE => {
                let t = self.take(3)?;
                if self.time == 0 {
                    return Err(TdfError::Malformed("relative timestamp without reference"));
                }
                // Sign-extend the 24-bit delta
                let delta = i32::from_le_bytes([t[0], t[1], t[2], 0]) << 8 >> 8;
                self.time = self.time.wrapping_add_signed(delta as i64);
                self.time
            }
            _ => 0,
        };

        let (data_type, tdf_num, period) = match id_flags & TDF_ARRAY_MASK {
            0 => (TdfDataType::Single, 1, 0),
            flags @ (TDF_ARRAY_TIME | TDF_ARRAY_DIFF) => {
                let a = self.take(TDF_ARRAY_HEADER_LEN)?;
                let period = decode_array_period(u16::from_le_bytes([a[1], a[2]]));
                let data_type = if flags == TDF_ARRAY_TIME {
                    TdfDataType::TimeArray
                } else {
                    TdfDataType::DiffArray
                };
                (data_type, a[0], period)
            }
            _ => return Err(TdfError::Malformed("unsupported array encoding")),
        };

        let data_len = match data_type {
            TdfDataType::DiffArray => tdf_len as usize + tdf_num as usize,
            _ => tdf_len as usize * tdf_num as usize,
        };
        let data = self.take(data_len)?;

        Ok(Some(TdfParsed {
            tdf_id,
            tdf_len,
            tdf_num,
            time,
            period,
            data_type,
            data,
        }))
    }
}

impl<'a> Iterator for TdfParser<'a> {
    type Item = Result<TdfParsed<'a>, TdfError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_tdf() {
            Ok(Some(parsed)) => Some(Ok(parsed)),
            Ok(None) => None,
            Err(e) => {
                // Nothing after a malformed record can be trusted
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

/// First record with `tdf_id` in `buf`, stopping at malformed data.
pub fn find_in_buf(buf: &[u8], tdf_id: u16) -> Option<TdfParsed<'_>> {
    TdfParser::new(buf)
        .map_while(Result::ok)
        .find(|p| p.tdf_id == tdf_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdf::TdfBuffer;
    use crate::time::epoch_time_from;

    #[test]
    fn round_trip_mixed_records() {
        let mut buf = TdfBuffer::new(256);
        let t0 = epoch_time_from(500_000, 0x4000);
        let samples: Vec<u8> = (0..24).collect();

        buf.add(10, 4, 1, 0, 0, &samples[..4]).unwrap();
        buf.add(11, 6, 4, t0, 0x20000, &samples).unwrap();
        buf.add(12, 2, 1, t0 + 100, 0, &samples[..2]).unwrap();
        buf.add(13, 3, 1, t0 + 0x10_0000, 0, &samples[..3]).unwrap();
        buf.add(14, 1, 1, t0 + 0x1_0000_0000, 0, &samples[..1]).unwrap();

        let parsed: Vec<_> = TdfParser::new(buf.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parsed.len(), 5);

        assert_eq!(parsed[0].tdf_id, 10);
        assert_eq!(parsed[0].time, 0);
        assert_eq!(parsed[0].data, &samples[..4]);

        assert_eq!(parsed[1].tdf_id, 11);
        assert_eq!(parsed[1].data_type, TdfDataType::TimeArray);
        assert_eq!(parsed[1].tdf_num, 4);
        assert_eq!(parsed[1].period, 0x20000);
        assert_eq!(parsed[1].time, t0);
        assert_eq!(parsed[1].record(3), Some(&samples[18..24]));
        assert_eq!(parsed[1].record(4), None);

        assert_eq!(parsed[2].time, t0 + 100);
        assert_eq!(parsed[3].time, t0 + 0x10_0000);
        assert_eq!(parsed[4].time, t0 + 0x1_0000_0000);
    }

    #[test]
    fn negative_extended_delta_round_trips() {
        let mut buf = TdfBuffer::new(64);
        let t0 = epoch_time_from(1_000, 0);
        buf.add(3, 1, 1, t0, 0, &[1]).unwrap();
        buf.add(3, 1, 1, t0 - 70_000, 0, &[2]).unwrap();
        let parsed: Vec<_> = TdfParser::new(buf.as_bytes()).map(Result::unwrap).collect();
        assert_eq!(parsed[1].time, t0 - 70_000);
    }

    #[test]
    fn relative_without_reference_is_malformed() {
        // RELATIVE | id 1, size 1, delta 5, payload
        let raw = [0x01, 0x80, 0x01, 0x05, 0x00, 0xAA];
        let mut parser = TdfParser::new(&raw);
        assert!(matches!(parser.next(), Some(Err(TdfError::Malformed(_)))));
        assert!(parser.next().is_none());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let raw = [0x01, 0x00, 0x08, 0x01, 0x02];
        assert!(matches!(
            TdfParser::new(&raw).next_tdf(),
            Err(TdfError::Malformed(_))
        ));
    }

    #[test]
    fn erased_storage_is_invalid_id() {
        let raw = [0xFF; 16];
        assert_eq!(
            TdfParser::new(&raw).next_tdf(),
            Err(TdfError::InvalidId(4095))
        );
    }

    #[test]
    fn diff_array_payload_length() {
        // DIFF | id 2, size 4, num 3 diff bytes, period 0
        let raw = [0x02, 0x20, 0x04, 0x03, 0x00, 0x00, 1, 2, 3, 4, 9, 9, 9];
        let parsed = TdfParser::new(&raw).next_tdf().unwrap().unwrap();
        assert_eq!(parsed.data_type, TdfDataType::DiffArray);
        assert_eq!(parsed.data.len(), 7);
        assert_eq!(parsed.record(0), None);
    }

    #[test]
    fn find_locates_first_matching_id() {
        let mut buf = TdfBuffer::new(64);
        buf.add(1, 1, 1, 0, 0, &[1]).unwrap();
        buf.add(2, 1, 1, 0, 0, &[2]).unwrap();
        buf.add(2, 1, 1, 0, 0, &[3]).unwrap();
        assert_eq!(find_in_buf(buf.as_bytes(), 2).map(|p| p.data), Some(&[2u8][..]));
        assert!(find_in_buf(buf.as_bytes(), 7).is_none());
    }
}
