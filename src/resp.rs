//! RESP (REdis Serialization Protocol) wire codec: §4.1 of the spec.
//!
//! Framing is exact down to the CRLF: every reply is built from [`Value`]
//! and serialized byte-for-byte per the table in the module spec, and every
//! request is parsed back into the same enum.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

const CRLF: &[u8] = b"\r\n";

/// A RESP value. `NoResponse` is not part of the wire protocol; it is an
/// internal sentinel handlers return to suppress writing any reply at all
/// (used for propagated commands applied on a replica).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Value>),
    NullBulk,
    NullArray,
    NoResponse,
}

impl Value {
    pub fn ok() -> Value {
        Value::SimpleString("OK".to_string())
    }

    pub fn bulk_str(s: impl Into<String>) -> Value {
        Value::Bulk(s.into().into_bytes())
    }

    pub fn array_of_bulks<I, S>(items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(
            items
                .into_iter()
                .map(|s| Value::bulk_str(s))
                .collect(),
        )
    }

    pub fn error(msg: impl Into<String>) -> Value {
        Value::Error(msg.into())
    }

    /// Serialize this value into `out`, appending the encoded bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Value::Error(e) => {
                out.push(b'-');
                out.extend_from_slice(e.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Value::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(CRLF);
            }
            Value::Bulk(b) => {
                out.push(b'$');
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.extend_from_slice(CRLF);
                out.extend_from_slice(b);
                out.extend_from_slice(CRLF);
            }
            Value::NullBulk => out.extend_from_slice(b"$-1\r\n"),
            Value::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(CRLF);
                for item in items {
                    item.encode(out);
                }
            }
            Value::NullArray => out.extend_from_slice(b"*-1\r\n"),
            Value::NoResponse => {}
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Write this value to an async sink and flush it.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        if matches!(self, Value::NoResponse) {
            return Ok(());
        }
        let bytes = self.to_bytes();
        writer.write_all(&bytes).await?;
        writer.flush().await
    }
}

/// Reads one line (up to but not including CRLF) from `reader`, byte by
/// byte. RESP headers are never large, so this is adequate without a
/// buffered front-end.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut line = Vec::new();
    loop {
        let b = reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CodecError::ShortRead
            } else {
                CodecError::Io(e)
            }
        })?;
        if b == b'\r' {
            let next = reader.read_u8().await?;
            if next != b'\n' {
                return Err(CodecError::MissingCrlf);
            }
            return Ok(line);
        }
        line.push(b);
    }
}

fn parse_ascii_int(bytes: &[u8]) -> Result<i64, CodecError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CodecError::MalformedInteger)
}

/// Decode one [`Value`] from `reader`. Intended to be called in a loop over
/// a persistent connection; each call consumes exactly one frame.
pub async fn decode_value<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Value, CodecError> {
    let prefix = reader.read_u8().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::ShortRead
        } else {
            CodecError::Io(e)
        }
    })?;
    match prefix {
        b'+' => {
            let line = read_line(reader).await?;
            Ok(Value::SimpleString(String::from_utf8_lossy(&line).into_owned()))
        }
        b'-' => {
            let line = read_line(reader).await?;
            Ok(Value::Error(String::from_utf8_lossy(&line).into_owned()))
        }
        b':' => {
            let line = read_line(reader).await?;
            Ok(Value::Integer(parse_ascii_int(&line)?))
        }
        b'$' => {
            let line = read_line(reader).await?;
            let len = parse_ascii_int(&line)?;
            if len < 0 {
                return Ok(Value::NullBulk);
            }
            let len = len as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    CodecError::ShortRead
                } else {
                    CodecError::Io(e)
                }
            })?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).await?;
            if crlf != *b"\r\n" {
                return Err(CodecError::MissingCrlf);
            }
            Ok(Value::Bulk(buf))
        }
        b'*' => {
            let line = read_line(reader).await?;
            let len = parse_ascii_int(&line)?;
            if len < 0 {
                return Ok(Value::NullArray);
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(Box::pin(decode_value(reader)).await?);
            }
            Ok(Value::Array(items))
        }
        other => Err(CodecError::UnknownPrefix(other)),
    }
}

/// Reads a `$L\r\n<L bytes>` bulk header+payload with **no trailing CRLF**,
/// exactly the framing used to embed an RDB snapshot in a replication
/// stream (spec §4.1, §4.3).
pub async fn read_rdb_bulk<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let prefix = reader.read_u8().await?;
    if prefix != b'$' {
        return Err(CodecError::UnknownPrefix(prefix));
    }
    let line = read_line(reader).await?;
    let len = parse_ascii_int(&line)?;
    if len < 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::ShortRead
        } else {
            CodecError::Io(e)
        }
    })?;
    Ok(buf)
}

/// Writes a `$L\r\n<L bytes>` bulk header+payload with no trailing CRLF.
pub async fn write_rdb_bulk<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let header = format!("${}\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Converts a decoded command array into an upper-cased command name plus
/// its string arguments. Every client request is an array of bulks.
pub fn as_command(value: &Value) -> Option<(String, Vec<String>)> {
    let Value::Array(items) = value else {
        return None;
    };
    if items.is_empty() {
        return None;
    }
    let mut strs = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Bulk(b) => strs.push(String::from_utf8_lossy(b).into_owned()),
            Value::SimpleString(s) => strs.push(s.clone()),
            _ => return None,
        }
    }
    let name = strs[0].to_uppercase();
    Some((name, strs[1..].to_vec()))
}

/// Serializes a command as a RESP array of bulks, the form used for
/// propagation to replicas and for the replica-to-primary handshake.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let value = Value::Array(args.iter().map(|a| Value::bulk_str(*a)).collect());
    value.to_bytes()
}
