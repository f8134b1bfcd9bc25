//! Control-stream record definitions and parsing
//!
//! Every control record has the same fixed layout, little-endian:
//!
//! ```text
//! [stream id: u64][stream type: u8][conn status: u8][address pair: 524]
//! ```
//!
//! Records may be concatenated in a single transport write and may be split
//! across reads; [`ControlDecoder`] reassembles them.

use crate::constants::{ADDRESS_PAIR_LEN, CONTROL_MESSAGE_LEN};
use crate::error::ControlError;
use crate::flow::address::AddressPair;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Role of a shaped-transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    /// Reserved stream carrying control records
    Control = 0,
    /// Reserved stream carrying padding
    Dummy = 1,
    /// One relayed flow
    Data = 2,
}

impl TryFrom<u8> for StreamType {
    type Error = ControlError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamType::Control),
            1 => Ok(StreamType::Dummy),
            2 => Ok(StreamType::Data),
            _ => Err(ControlError::InvalidStreamType(value)),
        }
    }
}

/// Lifecycle hint shared by control records and signal records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnStatus {
    Syn = 0,
    Ongoing = 1,
    Fin = 2,
}

impl TryFrom<u8> for ConnStatus {
    type Error = ControlError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnStatus::Syn),
            1 => Ok(ConnStatus::Ongoing),
            2 => Ok(ConnStatus::Fin),
            _ => Err(ControlError::InvalidConnStatus(value)),
        }
    }
}

/// One record on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub stream_id: u64,
    pub stream_type: StreamType,
    pub conn_status: ConnStatus,
    pub address: AddressPair,
}

impl ControlMessage {
    /// Announce the reserved control stream
    pub fn control(stream_id: u64) -> Self {
        Self {
            stream_id,
            stream_type: StreamType::Control,
            conn_status: ConnStatus::Syn,
            address: AddressPair::default(),
        }
    }

    /// Announce the reserved dummy stream
    pub fn dummy(stream_id: u64) -> Self {
        Self {
            stream_id,
            stream_type: StreamType::Dummy,
            conn_status: ConnStatus::Syn,
            address: AddressPair::default(),
        }
    }

    /// Bind a data stream to a new flow's endpoints
    pub fn syn(stream_id: u64, address: AddressPair) -> Self {
        Self {
            stream_id,
            stream_type: StreamType::Data,
            conn_status: ConnStatus::Syn,
            address,
        }
    }

    /// Close the sending direction of a data stream
    pub fn fin(stream_id: u64) -> Self {
        Self {
            stream_id,
            stream_type: StreamType::Data,
            conn_status: ConnStatus::Fin,
            address: AddressPair::default(),
        }
    }

    /// Serialize to exactly `CONTROL_MESSAGE_LEN` bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONTROL_MESSAGE_LEN);
        // Writes into a Vec cannot fail
        let _ = buf.write_u64::<LittleEndian>(self.stream_id);
        let _ = buf.write_u8(self.stream_type as u8);
        let _ = buf.write_u8(self.conn_status as u8);
        buf.extend_from_slice(&self.address.encode());
        buf
    }

    /// Parse exactly one record
    pub fn from_bytes(data: &[u8]) -> Result<Self, ControlError> {
        if data.len() != CONTROL_MESSAGE_LEN {
            return Err(ControlError::InvalidLength {
                expected: CONTROL_MESSAGE_LEN,
                actual: data.len(),
            });
        }
        let truncated = |_: std::io::Error| ControlError::InvalidLength {
            expected: CONTROL_MESSAGE_LEN,
            actual: data.len(),
        };
        let mut cursor = Cursor::new(data);
        let stream_id = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let stream_type = StreamType::try_from(cursor.read_u8().map_err(truncated)?)?;
        let conn_status = ConnStatus::try_from(cursor.read_u8().map_err(truncated)?)?;
        let mut address = [0u8; ADDRESS_PAIR_LEN];
        cursor.read_exact(&mut address).map_err(truncated)?;
        Ok(Self {
            stream_id,
            stream_type,
            conn_status,
            address: AddressPair::decode(&address)?,
        })
    }
}

/// Reassembles control records from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    buffer: Vec<u8>,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every record completed by them.
    ///
    /// A malformed record yields an error in its position and decoding
    /// continues with the next record boundary.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<ControlMessage, ControlError>> {
        self.buffer.extend_from_slice(bytes);
        let complete = self.buffer.len() / CONTROL_MESSAGE_LEN * CONTROL_MESSAGE_LEN;
        let messages = self.buffer[..complete]
            .chunks_exact(CONTROL_MESSAGE_LEN)
            .map(ControlMessage::from_bytes)
            .collect();
        self.buffer.drain(..complete);
        messages
    }

    /// Bytes held back waiting for the rest of a record
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> ControlMessage {
        ControlMessage::syn(
            42,
            AddressPair::from_endpoints("10.0.0.2:51000", "203.0.113.9:443").unwrap(),
        )
    }

    #[test]
    fn test_stream_type_from_u8() {
        assert_eq!(StreamType::try_from(0).unwrap(), StreamType::Control);
        assert_eq!(StreamType::try_from(1).unwrap(), StreamType::Dummy);
        assert_eq!(StreamType::try_from(2).unwrap(), StreamType::Data);
        assert_eq!(StreamType::try_from(3), Err(ControlError::InvalidStreamType(3)));
    }

    #[test]
    fn test_conn_status_from_u8() {
        assert_eq!(ConnStatus::try_from(0).unwrap(), ConnStatus::Syn);
        assert_eq!(ConnStatus::try_from(2).unwrap(), ConnStatus::Fin);
        assert_eq!(ConnStatus::try_from(7), Err(ControlError::InvalidConnStatus(7)));
    }

    #[test]
    fn test_record_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), CONTROL_MESSAGE_LEN);
        assert_eq!(&bytes[..8], &42u64.to_le_bytes());
        assert_eq!(bytes[8], StreamType::Data as u8);
        assert_eq!(bytes[9], ConnStatus::Syn as u8);
        assert_eq!(&bytes[10..18], b"10.0.0.2");
        assert_eq!(ControlMessage::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            ControlMessage::from_bytes(&bytes[..100]),
            Err(ControlError::InvalidLength { actual: 100, .. })
        ));
    }

    #[test]
    fn test_from_bytes_rejects_bad_discriminants() {
        let mut bytes = sample().to_bytes();
        bytes[8] = 9;
        assert_eq!(ControlMessage::from_bytes(&bytes), Err(ControlError::InvalidStreamType(9)));
        let mut bytes = sample().to_bytes();
        bytes[9] = 9;
        assert_eq!(ControlMessage::from_bytes(&bytes), Err(ControlError::InvalidConnStatus(9)));
    }

    #[test]
    fn test_decoder_handles_concatenated_records() {
        let mut wire = ControlMessage::control(0).to_bytes();
        wire.extend(ControlMessage::dummy(4).to_bytes());
        wire.extend(ControlMessage::fin(8).to_bytes());

        let mut decoder = ControlDecoder::new();
        let messages: Vec<_> = decoder.push(&wire).into_iter().map(Result::unwrap).collect();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].stream_type, StreamType::Control);
        assert_eq!(messages[1].stream_id, 4);
        assert_eq!(messages[2].conn_status, ConnStatus::Fin);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_keeps_partial_record() {
        let wire = sample().to_bytes();
        let mut decoder = ControlDecoder::new();
        assert!(decoder.push(&wire[..300]).is_empty());
        assert_eq!(decoder.pending(), 300);
        let messages = decoder.push(&wire[300..]);
        assert_eq!(messages, vec![Ok(sample())]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_continues_after_bad_record() {
        let mut bad = sample().to_bytes();
        bad[8] = 0xee;
        let mut wire = bad;
        wire.extend(sample().to_bytes());

        let mut decoder = ControlDecoder::new();
        let messages = decoder.push(&wire);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_err());
        assert_eq!(messages[1], Ok(sample()));
    }

    proptest! {
        #[test]
        fn test_decoder_arbitrary_data_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..3000)) {
            let mut decoder = ControlDecoder::new();
            let messages = decoder.push(&data);
            prop_assert_eq!(messages.len(), data.len() / CONTROL_MESSAGE_LEN);
            prop_assert_eq!(decoder.pending(), data.len() % CONTROL_MESSAGE_LEN);
        }

        #[test]
        fn test_decoder_independent_of_split_points(
            ids in prop::collection::vec(any::<u64>(), 1..6),
            splits in prop::collection::vec(1usize..700, 1..20),
        ) {
            let records: Vec<ControlMessage> = ids.iter().map(|&id| ControlMessage::fin(id)).collect();
            let wire: Vec<u8> = records.iter().flat_map(|r| r.to_bytes()).collect();

            let mut decoder = ControlDecoder::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            let mut i = 0;
            while offset < wire.len() {
                let end = (offset + splits[i % splits.len()]).min(wire.len());
                i += 1;
                for message in decoder.push(&wire[offset..end]) {
                    decoded.push(message.unwrap());
                }
                offset = end;
            }
            prop_assert_eq!(decoded, records);
            prop_assert_eq!(decoder.pending(), 0);
        }
    }
}
