use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SerializationError;
use crate::record::TelemetryRecord;

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const COUNT_LEN: usize = 8;
pub const RECORD_LEN: usize = 3 * 4;

/// Largest integer a 64-bit double carries without rounding.
pub const MAX_EXACT_COUNT: u64 = 1 << 53;

/// The part of a record that survives the trip over the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub water_level: f32,
}

impl From<&TelemetryRecord> for Reading {
    fn from(r: &TelemetryRecord) -> Self {
        Self {
            temperature: r.temperature,
            humidity: r.humidity,
            water_level: r.water_level,
        }
    }
}

/// Encodes `records` as a count followed by three floats per record.
///
/// The count is an `f64` and every measurement an `f32`, all little-endian.
/// Nothing is returned unless every record is encodable.
pub fn serialize(records: &[TelemetryRecord]) -> Result<Vec<u8>, SerializationError> {
    if records.len() as u64 > MAX_EXACT_COUNT {
        return Err(SerializationError::TooManyRecords(records.len()));
    }

    let mut buf = Vec::with_capacity(COUNT_LEN + records.len() * RECORD_LEN);
    buf.extend_from_slice(&(records.len() as f64).to_le_bytes());

    for (index, record) in records.iter().enumerate() {
        for (field, value) in record.fields() {
            if !value.is_finite() {
                return Err(SerializationError::NonFinite { index, field });
            }
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    Ok(buf)
}

pub fn deserialize(payload: &[u8]) -> Result<Vec<Reading>, SerializationError> {
    let Some((head, body)) = payload.split_first_chunk::<COUNT_LEN>() else {
        return Err(SerializationError::Truncated(payload.len()));
    };

    let count = f64::from_le_bytes(*head);
    let expected = body.len() / RECORD_LEN;
    if count.fract() != 0.0
        || count < 0.0
        || count != expected as f64
        || body.len() % RECORD_LEN != 0
    {
        return Err(SerializationError::Malformed {
            count,
            len: payload.len(),
        });
    }

    let readings = body
        .chunks_exact(RECORD_LEN)
        .map(|chunk| {
            let float_at = |i: usize| {
                let mut b = [0u8; 4];
                b.copy_from_slice(&chunk[i * 4..i * 4 + 4]);
                f32::from_le_bytes(b)
            };
            Reading {
                temperature: float_at(0),
                humidity: float_at(1),
                water_level: float_at(2),
            }
        })
        .collect();

    Ok(readings)
}

/// Writes a big-endian `u32` byte length followed by `payload` in one write.
pub async fn send_framed<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes doesn't fit a frame", payload.len()),
        )
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads one frame. Returns `Ok(None)` if the peer closed before the prefix.
pub async fn read_framed<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max_len}"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
