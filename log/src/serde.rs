//! Wire format for log rows, message entries, and system settings.
//!
//! # Row keys
//!
//! Messages live under 12-byte row keys built from three big-endian u32
//! fields:
//!
//! ```text
//! | partition bits (u32 BE) | bucket id (u32 BE) | timeslice (u32 BE) |
//! ```
//!
//! The partition id occupies the *upper* `partition_bit_width` bits of the
//! first field, so stores that range-partition on key prefixes spread
//! partitions across their key space. The timeslice is
//! `timestamp / TIMESLICE_INTERVAL_MICROS`; consecutive 100-second windows
//! of one (partition, bucket) land on consecutive keys, which keeps polls
//! range-scannable.
//!
//! # Message entries
//!
//! Within a row, each message is one column-value entry:
//!
//! ```text
//! | timestamp (i64 BE) | sender (u16 len + utf8) | sequence (i64 BE) | payload |
//!                                                                   ^ value split
//! ```
//!
//! The timestamp leads the column, so lexicographic column order equals
//! timestamp order within a row, with sender and sequence as tie-breaks.
//!
//! # System settings
//!
//! The all-ones partition id is reserved for settings and unreachable from
//! real partition ids, which only occupy the upper `partition_bit_width`
//! bits. Setting rows are keyed by `0xFFFFFFFF ‖ identifier`; the first
//! byte of a setting column tags its kind (1 = message counter, 2 = read
//! marker).
//!
//! `TIMESLICE_INTERVAL_MICROS` is wire format. Changing it reshuffles
//! every existing row key.

use bytes::{BufMut, Bytes, BytesMut};
use tidelog_common::Entry;

use crate::error::{Error, Result};
use crate::model::Message;

/// The time period stored under one row key: 100 seconds, in microseconds.
pub(crate) const TIMESLICE_INTERVAL_MICROS: i64 = 100_000_000;

/// Partition id reserved for system settings.
pub(crate) const SYSTEM_PARTITION_ID: u32 = 0xFFFF_FFFF;

const MESSAGE_COUNTER: u8 = 1;
const MARKER_PREFIX: u8 = 2;

/// Maps a microsecond timestamp onto its 32-bit timeslice index.
pub(crate) fn time_slice(timestamp_micros: i64) -> Result<u32> {
    let value = timestamp_micros / TIMESLICE_INTERVAL_MICROS;
    if value < 0 || value > i32::MAX as i64 {
        return Err(Error::InvalidArgument(format!(
            "timestamp overflow detected: {timestamp_micros}"
        )));
    }
    Ok(value as u32)
}

/// The key geometry of one log: how many partition bits lead the key and
/// how many buckets subdivide each timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeySpace {
    pub partition_bit_width: u32,
    pub num_buckets: u32,
}

impl KeySpace {
    pub(crate) fn new(partition_bit_width: u32, num_buckets: u32) -> Result<Self> {
        if partition_bit_width > 32 {
            return Err(Error::InvalidArgument(format!(
                "partition bit width must be in [0, 32], got {partition_bit_width}"
            )));
        }
        if num_buckets < 1 {
            return Err(Error::InvalidArgument(
                "num_buckets must be at least 1".into(),
            ));
        }
        Ok(Self {
            partition_bit_width,
            num_buckets,
        })
    }

    pub(crate) fn check_partition(&self, partition_id: u32) -> Result<()> {
        if (partition_id as u64) >= (1u64 << self.partition_bit_width) {
            return Err(Error::InvalidArgument(format!(
                "invalid partition id {partition_id} for bit width {}",
                self.partition_bit_width
            )));
        }
        Ok(())
    }

    /// Builds the 12-byte row key for (partition, bucket, timeslice).
    pub(crate) fn log_key(&self, partition_id: u32, bucket_id: u32, timeslice: u32) -> Result<Bytes> {
        self.check_partition(partition_id)?;
        if bucket_id >= self.num_buckets {
            return Err(Error::InvalidArgument(format!(
                "invalid bucket id {bucket_id} for {} buckets",
                self.num_buckets
            )));
        }
        // Shift the partition bits to the front of the first field. Done in
        // 64-bit so a width of 0 degenerates to 0 instead of overflowing.
        let partition_bits = ((partition_id as u64) << (32 - self.partition_bit_width)) as u32;
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(partition_bits);
        buf.put_u32(bucket_id);
        buf.put_u32(timeslice);
        Ok(buf.freeze())
    }

    /// Derives a partition id from the first up-to-4 bytes of a routing
    /// key, keeping the most significant bits.
    pub(crate) fn partition_for_routing_key(&self, routing_key: &[u8]) -> u32 {
        let mut value: u32 = 0;
        for i in 0..4 {
            let b = routing_key.get(i).copied().unwrap_or(0) as u32;
            value = (value << 8) | b;
        }
        ((value as u64) >> (32 - self.partition_bit_width as u64)) as u32
    }
}

/// Encodes a message as a store entry, recording the column/value split.
pub(crate) fn encode_message(
    timestamp_micros: i64,
    sender_id: &str,
    sequence: i64,
    payload: &Bytes,
) -> Result<Entry> {
    if timestamp_micros <= 0 {
        return Err(Error::InvalidArgument(format!(
            "message timestamp must be positive, got {timestamp_micros}"
        )));
    }
    let mut buf = BytesMut::with_capacity(8 + 2 + sender_id.len() + 8 + payload.len());
    buf.put_i64(timestamp_micros);
    put_string(&mut buf, sender_id)?;
    buf.put_i64(sequence);
    let value_pos = buf.len();
    buf.put_slice(payload);
    Ok(Entry::new(buf.freeze(), value_pos))
}

/// Decodes the column portion of a message entry. The sequence number is
/// present in the column but not needed on the read side.
pub(crate) fn decode_message(entry: &Entry) -> Result<Message> {
    let column = entry.column();
    let mut buf = column.as_ref();
    let timestamp_micros = get_i64(&mut buf)?;
    let sender_id = get_string(&mut buf)?;
    if buf.len() < 8 {
        return Err(Error::Encoding(
            "message column truncated before sequence number".into(),
        ));
    }
    Ok(Message {
        payload: entry.value(),
        timestamp_micros,
        sender_id,
    })
}

/// Reads the leading timestamp of a message entry's column.
pub(crate) fn entry_timestamp(entry: &Entry) -> Result<i64> {
    let column = entry.column();
    let mut buf = column.as_ref();
    get_i64(&mut buf)
}

/// The single-byte column holding a sender's message counter.
pub(crate) fn message_counter_column() -> Bytes {
    Bytes::from_static(&[MESSAGE_COUNTER])
}

/// The 9-byte column holding the read cursor of one (partition, bucket).
pub(crate) fn marker_column(partition_id: u32, bucket_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(MARKER_PREFIX);
    buf.put_u32(partition_id);
    buf.put_u32(bucket_id);
    buf.freeze()
}

/// The row key of a setting: the reserved system partition followed by the
/// length-prefixed identifier.
pub(crate) fn setting_key(identifier: &str) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(4 + 2 + identifier.len());
    buf.put_u32(SYSTEM_PARTITION_ID);
    put_string(&mut buf, identifier)?;
    Ok(buf.freeze())
}

/// Column bound for a microsecond timestamp: 8 bytes big-endian.
pub(crate) fn timestamp_column(timestamp_micros: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64(timestamp_micros);
    buf.freeze()
}

pub(crate) fn encode_counter(value: i64) -> Bytes {
    timestamp_column(value)
}

/// Decodes an 8-byte big-endian counter. Any other length is fatal: it
/// means the setting row holds something that is not a counter.
pub(crate) fn decode_counter(value: &[u8]) -> Result<i64> {
    if value.len() != 8 {
        return Err(Error::InvalidArgument(format!(
            "setting value must be 8 bytes, got {}",
            value.len()
        )));
    }
    let mut buf = value;
    get_i64(&mut buf)
}

/// The smallest buffer lexicographically greater than `column`: the column
/// with a zero byte appended.
pub(crate) fn next_bigger(column: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(column.len() + 1);
    buf.put_slice(column);
    buf.put_u8(0);
    buf.freeze()
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "string too long to length-prefix: {} bytes",
            value.len()
        )));
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.len() < 2 {
        return Err(Error::Encoding("buffer too short for string length".into()));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    *buf = &buf[2..];
    if buf.len() < len {
        return Err(Error::Encoding(format!(
            "buffer too short for string: need {len} bytes, got {}",
            buf.len()
        )));
    }
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::Encoding(format!("invalid utf8 in string: {e}")))?
        .to_string();
    *buf = &buf[len..];
    Ok(value)
}

fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.len() < 8 {
        return Err(Error::Encoding(format!(
            "buffer too short for i64: got {} bytes",
            buf.len()
        )));
    }
    let value = i64::from_be_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ]);
    *buf = &buf[8..];
    Ok(value)
}
