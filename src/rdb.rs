//! RDB snapshot loader: the subset of the binary format described in
//! spec §4.4, used only to seed the keyspace at startup.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::entry::Entry;
use crate::error::RdbError;
use crate::keyspace::Keyspace;

const MAGIC: &[u8; 9] = b"REDIS0011";

const OPCODE_META: u8 = 0xFA;
const OPCODE_START_DB: u8 = 0xFE;
const OPCODE_RESIZE_DB: u8 = 0xFB;
const OPCODE_EOF: u8 = 0xFF;
const OPCODE_EXPIRETIME_MS: u8 = 0xFC;
const OPCODE_EXPIRETIME_S: u8 = 0xFD;
const META_SKIP_BYTE: u8 = 0x40;

/// A record was cut short mid-parse. The loader is resilient to this: it
/// simply stops and returns the keyspace as loaded so far (spec §4.4).
struct Truncated;

enum Step {
    Truncated,
    Fatal(RdbError),
}

impl From<Truncated> for Step {
    fn from(_: Truncated) -> Self {
        Step::Truncated
    }
}

impl From<RdbError> for Step {
    fn from(e: RdbError) -> Self {
        Step::Fatal(e)
    }
}

impl From<std::io::Error> for Step {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Step::Truncated
        } else {
            Step::Fatal(RdbError::Io(e))
        }
    }
}

type StepResult<T> = Result<T, Step>;

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> StepResult<()> {
    reader.read_exact(buf).await?;
    Ok(())
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> StepResult<u8> {
    let mut b = [0u8; 1];
    read_exact(reader, &mut b).await?;
    Ok(b[0])
}

/// Reads one length per the encoding in spec §4.4: the first byte's top
/// two bits choose 6-bit / 14-bit / 32-bit / special forms.
async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> StepResult<usize> {
    let first = read_u8(reader).await?;
    match first >> 6 {
        0b00 => Ok((first & 0x3F) as usize),
        0b01 => {
            let second = read_u8(reader).await?;
            Ok((((first & 0x3F) as usize) << 8) | second as usize)
        }
        0b10 => {
            let mut buf = [0u8; 4];
            read_exact(reader, &mut buf).await?;
            Ok(u32::from_be_bytes(buf) as usize)
        }
        _ => Ok(0),
    }
}

async fn read_length_prefixed_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> StepResult<Vec<u8>> {
    let len = read_length(reader).await?;
    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf).await?;
    Ok(buf)
}

async fn skip_metadata<R: AsyncRead + Unpin>(reader: &mut R) -> StepResult<()> {
    let first_key_byte = read_u8(reader).await?;
    if first_key_byte == META_SKIP_BYTE {
        return Ok(());
    }
    let key_len = read_length_from_first_byte(reader, first_key_byte).await?;
    let mut key = vec![0u8; key_len];
    read_exact(reader, &mut key).await?;

    let first_value_byte = read_u8(reader).await?;
    let value_len = read_length_from_first_byte(reader, first_value_byte).await?;
    let mut value = vec![0u8; value_len];
    read_exact(reader, &mut value).await?;
    Ok(())
}

/// Length decoding, but the first byte has already been consumed by the
/// caller (used where a value/key's first byte also doubles as a marker
/// the caller peeked at).
async fn read_length_from_first_byte<R: AsyncRead + Unpin>(reader: &mut R, first: u8) -> StepResult<usize> {
    match first >> 6 {
        0b00 => Ok((first & 0x3F) as usize),
        0b01 => {
            let second = read_u8(reader).await?;
            Ok((((first & 0x3F) as usize) << 8) | second as usize)
        }
        0b10 => {
            let mut buf = [0u8; 4];
            read_exact(reader, &mut buf).await?;
            Ok(u32::from_be_bytes(buf) as usize)
        }
        _ => Ok(0),
    }
}

/// Reads one key/value record, given the byte that starts it (either an
/// expiry opcode or a bare value-type byte), and inserts it into the
/// keyspace.
async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    keyspace: &Keyspace,
    first_byte: u8,
) -> StepResult<()> {
    let (expires_at_ms, value_type) = match first_byte {
        OPCODE_EXPIRETIME_MS => {
            let mut padding = [0u8; 4];
            read_exact(reader, &mut padding).await?;
            let mut secs_buf = [0u8; 4];
            read_exact(reader, &mut secs_buf).await?;
            let secs = u32::from_be_bytes(secs_buf) as u64;
            let mut trailing = [0u8; 2];
            read_exact(reader, &mut trailing).await?;
            (secs * 1000, 0x00u8)
        }
        OPCODE_EXPIRETIME_S => {
            let mut ms_buf = [0u8; 4];
            read_exact(reader, &mut ms_buf).await?;
            let ms = u32::from_be_bytes(ms_buf) as u64;
            let value_type = read_u8(reader).await?;
            (ms, value_type)
        }
        other => (0, other),
    };

    if value_type != 0x00 && value_type != 0x01 {
        return Err(RdbError::UnsupportedValueType(value_type).into());
    }

    let key = read_length_prefixed_bytes(reader).await?;
    let value = read_length_prefixed_bytes(reader).await?;
    let key = String::from_utf8_lossy(&key).into_owned();
    keyspace.insert_raw(key, Entry::new_string(value, expires_at_ms)).await;
    Ok(())
}

async fn run<R: AsyncRead + Unpin>(reader: &mut R, keyspace: &Keyspace) -> StepResult<()> {
    let mut header = [0u8; 9];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|_| Step::Fatal(RdbError::InvalidHeader))?;
    if &header != MAGIC {
        return Err(Step::Fatal(RdbError::InvalidHeader));
    }

    loop {
        let marker = read_u8(reader).await?;
        match marker {
            OPCODE_META => skip_metadata(reader).await?,
            OPCODE_START_DB => {
                read_length(reader).await?;
            }
            OPCODE_RESIZE_DB => {
                read_length(reader).await?;
                read_length(reader).await?;
            }
            OPCODE_EOF => return Ok(()),
            other => read_record(reader, keyspace, other).await?,
        }
    }
}

/// Loads a seed snapshot into `keyspace`. Truncation past a complete
/// record is not an error (spec §4.4); a malformed header is.
pub async fn load<R: AsyncRead + Unpin>(reader: &mut R, keyspace: &Keyspace) -> Result<(), RdbError> {
    match run(reader, keyspace).await {
        Ok(()) => Ok(()),
        Err(Step::Truncated) => Ok(()),
        Err(Step::Fatal(e)) => Err(e),
    }
}
