//! Wire encoding for the body of every message kind.
//!
//! Every frame's payload is `kind: u32 LE | correlation: u64 LE | body`. This
//! module encodes/decodes the `body` part only; [`crate::transport`] handles
//! framing and the `kind`/`correlation` header.

use crate::{
    error::ProtocolError,
    kind::MessageKind,
    value::{ColumnDescriptor, SqliteType, TypedValue},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn read_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::FrameTooShort {
            expected: 4,
            actual: buf.remaining(),
        });
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::FrameTooShort {
            expected: len,
            actual: buf.remaining(),
        });
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(std::str::from_utf8(&bytes)?.to_owned())
}

fn write_handle(buf: &mut BytesMut, handle: u128) {
    buf.put_u128_le(handle);
}

fn read_handle(buf: &mut Bytes) -> Result<u128, ProtocolError> {
    if buf.remaining() < 16 {
        return Err(ProtocolError::FrameTooShort {
            expected: 16,
            actual: buf.remaining(),
        });
    }
    Ok(buf.get_u128_le())
}

fn ensure_exhausted(buf: &Bytes) -> Result<(), ProtocolError> {
    if buf.has_remaining() {
        Err(ProtocolError::TrailingBytes)
    } else {
        Ok(())
    }
}

/// A fully decoded frame payload: the message kind, its correlation id, and
/// the still-undecoded body bytes. [`crate::transport::Transport`] produces
/// and consumes these; callers decode the body with the functions below once
/// they know, from the kind (and for `ExecuteReaderResponse`, from what they
/// asked for), which shape to expect.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    pub correlation: u64,
    pub body: Bytes,
}

impl Envelope {
    pub fn encode(kind: MessageKind, correlation: u64, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 8 + body.len());
        buf.put_u32_le(kind.as_u32());
        buf.put_u64_le(correlation);
        buf.put_slice(body);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        if frame.remaining() < 12 {
            return Err(ProtocolError::FrameTooShort {
                expected: 12,
                actual: frame.remaining(),
            });
        }
        let raw_kind = frame.get_u32_le();
        let correlation = frame.get_u64_le();
        let kind = MessageKind::from_u32(raw_kind).ok_or(ProtocolError::UnknownKind(raw_kind))?;
        Ok(Self {
            kind,
            correlation,
            body: frame,
        })
    }
}

pub struct CreateCommandRequest {
    pub sql: String,
}

impl CreateCommandRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.sql);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let sql = read_string(&mut body)?;
        ensure_exhausted(&body)?;
        Ok(Self { sql })
    }
}

pub struct CreateCommandResponse {
    pub handle: u128,
}

impl CreateCommandResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_handle(&mut buf, self.handle);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let handle = read_handle(&mut body)?;
        ensure_exhausted(&body)?;
        Ok(Self { handle })
    }
}

pub struct ExceptionBody {
    pub message: String,
}

impl ExceptionBody {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let message = read_string(&mut body)?;
        ensure_exhausted(&body)?;
        Ok(Self { message })
    }
}

pub struct HandleOnly {
    pub handle: u128,
}

impl HandleOnly {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_handle(&mut buf, self.handle);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let handle = read_handle(&mut body)?;
        ensure_exhausted(&body)?;
        Ok(Self { handle })
    }
}

pub struct ExecuteNonQueryResponse {
    pub changes: i32,
}

impl ExecuteNonQueryResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.changes);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.remaining() < 4 {
            return Err(ProtocolError::FrameTooShort {
                expected: 4,
                actual: body.remaining(),
            });
        }
        let changes = body.get_i32_le();
        ensure_exhausted(&body)?;
        Ok(Self { changes })
    }
}

pub struct ExecuteReaderRequest {
    pub handle: u128,
    pub behavior: u32,
}

impl ExecuteReaderRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_handle(&mut buf, self.handle);
        buf.put_u32_le(self.behavior);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let handle = read_handle(&mut body)?;
        if body.remaining() < 4 {
            return Err(ProtocolError::FrameTooShort {
                expected: 4,
                actual: body.remaining(),
            });
        }
        let behavior = body.get_u32_le();
        ensure_exhausted(&body)?;
        Ok(Self { handle, behavior })
    }
}

/// Body of `ExecuteReaderResponse` sent in reply to `ExecuteReaderRequest`:
/// the column descriptor list.
pub struct ExecuteReaderInitialResponse {
    pub columns: Vec<ColumnDescriptor>,
}

impl ExecuteReaderInitialResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.columns.len() as u16);
        for col in &self.columns {
            write_string(&mut buf, &col.name);
            buf.put_u8(col.sqlite_type.as_u8());
        }
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.remaining() < 2 {
            return Err(ProtocolError::FrameTooShort {
                expected: 2,
                actual: body.remaining(),
            });
        }
        let count = body.get_u16_le();
        let mut columns = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let name = read_string(&mut body)?;
            if !body.has_remaining() {
                return Err(ProtocolError::FrameTooShort {
                    expected: 1,
                    actual: 0,
                });
            }
            let sqlite_type = SqliteType::from_u8(body.get_u8())
                .ok_or(ProtocolError::UnexpectedBody(MessageKind::ExecuteReaderResponse))?;
            columns.push(ColumnDescriptor {
                ordinal,
                name,
                sqlite_type,
            });
        }
        ensure_exhausted(&body)?;
        Ok(Self { columns })
    }
}

/// Body of `ExecuteReaderResponse` sent in reply to `ExecuteReaderReadRequest`.
pub struct ExecuteReaderReadResponse {
    pub has_row: bool,
}

impl ExecuteReaderReadResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(if self.has_row { 1 } else { 0 });
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.remaining() < 1 {
            return Err(ProtocolError::FrameTooShort {
                expected: 1,
                actual: 0,
            });
        }
        let has_row = body.get_u8() != 0;
        ensure_exhausted(&body)?;
        Ok(Self { has_row })
    }
}

pub struct ExecuteReaderGetOrdinalRequest {
    pub handle: u128,
    pub name: String,
}

impl ExecuteReaderGetOrdinalRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_handle(&mut buf, self.handle);
        write_string(&mut buf, &self.name);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let handle = read_handle(&mut body)?;
        let name = read_string(&mut body)?;
        ensure_exhausted(&body)?;
        Ok(Self { handle, name })
    }
}

pub struct ExecuteReaderGetRequest {
    pub handle: u128,
    pub ordinal: u16,
}

impl ExecuteReaderGetRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_handle(&mut buf, self.handle);
        buf.put_u16_le(self.ordinal);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let handle = read_handle(&mut body)?;
        if body.remaining() < 2 {
            return Err(ProtocolError::FrameTooShort {
                expected: 2,
                actual: body.remaining(),
            });
        }
        let ordinal = body.get_u16_le();
        ensure_exhausted(&body)?;
        Ok(Self { handle, ordinal })
    }
}

/// Body of `ExecuteReaderResponse` sent in reply to `GetOrdinalRequest` or any
/// `Get{Int16,Int32,Int64,String,FieldType}Request` — a single typed value.
///
/// `GetOrdinal` piggy-backs on this same shape: an absent column is encoded
/// as `TypedValue::Int32(-1)`.
pub struct ExecuteReaderTypedResponse {
    pub value: TypedValue,
}

impl ExecuteReaderTypedResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.value.tag());
        match &self.value {
            TypedValue::Null => {}
            TypedValue::Int16(v) => buf.put_i16_le(*v),
            TypedValue::Int32(v) => buf.put_i32_le(*v),
            TypedValue::Int64(v) => buf.put_i64_le(*v),
            TypedValue::Text(s) => write_string(&mut buf, s),
            TypedValue::FieldType(t) => buf.put_u8(t.as_u8()),
        }
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.remaining() < 1 {
            return Err(ProtocolError::FrameTooShort {
                expected: 1,
                actual: 0,
            });
        }
        let tag = body.get_u8();
        let value = match tag {
            0 => TypedValue::Null,
            1 => {
                if body.remaining() < 2 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: 2,
                        actual: body.remaining(),
                    });
                }
                TypedValue::Int16(body.get_i16_le())
            }
            2 => {
                if body.remaining() < 4 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: 4,
                        actual: body.remaining(),
                    });
                }
                TypedValue::Int32(body.get_i32_le())
            }
            3 => {
                if body.remaining() < 8 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: 8,
                        actual: body.remaining(),
                    });
                }
                TypedValue::Int64(body.get_i64_le())
            }
            4 => TypedValue::Text(read_string(&mut body)?),
            5 => {
                if body.remaining() < 1 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: 1,
                        actual: 0,
                    });
                }
                let raw = body.get_u8();
                TypedValue::FieldType(
                    SqliteType::from_u8(raw)
                        .ok_or(ProtocolError::UnexpectedBody(MessageKind::ExecuteReaderResponse))?,
                )
            }
            _ => return Err(ProtocolError::UnexpectedBody(MessageKind::ExecuteReaderResponse)),
        };
        ensure_exhausted(&body)?;
        Ok(Self { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_command_request_round_trips() {
        let req = CreateCommandRequest {
            sql: "SELECT 1".to_owned(),
        };
        let decoded = CreateCommandRequest::decode(req.encode()).unwrap();
        assert_eq!(decoded.sql, "SELECT 1");
    }

    #[test]
    fn column_descriptor_list_round_trips() {
        let resp = ExecuteReaderInitialResponse {
            columns: vec![
                ColumnDescriptor {
                    ordinal: 0,
                    name: "x".to_owned(),
                    sqlite_type: SqliteType::Integer,
                },
                ColumnDescriptor {
                    ordinal: 1,
                    name: "y".to_owned(),
                    sqlite_type: SqliteType::Text,
                },
            ],
        };
        let decoded = ExecuteReaderInitialResponse::decode(resp.encode()).unwrap();
        assert_eq!(decoded.columns.len(), 2);
        assert_eq!(decoded.columns[1].name, "y");
        assert_eq!(decoded.columns[1].sqlite_type, SqliteType::Text);
    }

    #[test]
    fn typed_value_round_trips_each_variant() {
        for value in [
            TypedValue::Null,
            TypedValue::Int16(-7),
            TypedValue::Int32(-1),
            TypedValue::Int64(i64::MIN),
            TypedValue::Text("hello".to_owned()),
            TypedValue::FieldType(SqliteType::Blob),
        ] {
            let resp = ExecuteReaderTypedResponse {
                value: value.clone(),
            };
            let decoded = ExecuteReaderTypedResponse::decode(resp.encode()).unwrap();
            assert_eq!(decoded.value, value);
        }
    }

    #[test]
    fn envelope_round_trips_kind_and_correlation() {
        let body = HandleOnly { handle: 42 }.encode();
        let frame = Envelope::encode(MessageKind::DisposeCommand, 99, &body);
        let envelope = Envelope::decode(frame).unwrap();
        assert_eq!(envelope.kind, MessageKind::DisposeCommand);
        assert_eq!(envelope.correlation, 99);
        assert_eq!(HandleOnly::decode(envelope.body).unwrap().handle, 42);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(9999);
        buf.put_u64_le(1);
        let err = Envelope::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(9999)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = BytesMut::new();
        body.put_u128_le(1);
        body.put_u8(0xff);
        let err = HandleOnly::decode(body.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::TrailingBytes));
    }
}
