//! Typed command parameters: the five primitive types carried in a command's
//! parameter block, and their strict on-wire shape.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TseError};

const TAG_BYTE: u8 = 0x01;
const TAG_BYTE_ARRAY: u8 = 0x02;
const TAG_SHORT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_LONG_ARRAY: u8 = 0x05;

/// A single typed parameter, as carried in a command or response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedParam {
    Byte(u8),
    ByteArray(Vec<u8>),
    Short(u16),
    String(String),
    LongArray(Vec<u32>),
}

fn ensure_remaining(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(TseError::Framing("truncated typed parameter".into()));
    }
    Ok(())
}

impl TypedParam {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            TypedParam::Byte(value) => {
                buf.put_u8(TAG_BYTE);
                buf.put_u16(0x0001);
                buf.put_u8(*value);
            }
            TypedParam::ByteArray(bytes) => {
                buf.put_u8(TAG_BYTE_ARRAY);
                let len = u16::try_from(bytes.len())
                    .map_err(|_| TseError::Framing("BYTE_ARRAY parameter too long".into()))?;
                buf.put_u16(len);
                buf.put_slice(bytes);
            }
            TypedParam::Short(value) => {
                buf.put_u8(TAG_SHORT);
                buf.put_u16(0x0002);
                buf.put_u16(*value);
            }
            TypedParam::String(value) => {
                if !value.is_ascii() {
                    return Err(TseError::Framing(
                        "STRING parameter must be 7-bit ASCII".into(),
                    ));
                }
                buf.put_u8(TAG_STRING);
                let len = u16::try_from(value.len())
                    .map_err(|_| TseError::Framing("STRING parameter too long".into()))?;
                buf.put_u16(len);
                buf.put_slice(value.as_bytes());
            }
            TypedParam::LongArray(values) => {
                buf.put_u8(TAG_LONG_ARRAY);
                buf.put_u16(0x0002);
                let byte_len = u16::try_from(values.len() * 4).map_err(|_| {
                    TseError::Framing("LONG_ARRAY parameter too long".into())
                })?;
                buf.put_u16(byte_len);
                for value in values {
                    buf.put_u32(*value);
                }
            }
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<TypedParam> {
        ensure_remaining(buf, 1)?;
        let tag = buf.get_u8();
        match tag {
            TAG_BYTE => {
                ensure_remaining(buf, 3)?;
                let marker = buf.get_u16();
                if marker != 0x0001 {
                    return Err(TseError::Framing(
                        "BYTE parameter has a malformed length marker".into(),
                    ));
                }
                Ok(TypedParam::Byte(buf.get_u8()))
            }
            TAG_BYTE_ARRAY => {
                ensure_remaining(buf, 2)?;
                let len = buf.get_u16() as usize;
                ensure_remaining(buf, len)?;
                Ok(TypedParam::ByteArray(buf.copy_to_bytes(len).to_vec()))
            }
            TAG_SHORT => {
                ensure_remaining(buf, 4)?;
                let marker = buf.get_u16();
                if marker != 0x0002 {
                    return Err(TseError::Framing(
                        "SHORT parameter has a malformed length marker".into(),
                    ));
                }
                Ok(TypedParam::Short(buf.get_u16()))
            }
            TAG_STRING => {
                ensure_remaining(buf, 2)?;
                let len = buf.get_u16() as usize;
                ensure_remaining(buf, len)?;
                let body = buf.copy_to_bytes(len);
                if !body.is_ascii() {
                    return Err(TseError::Framing(
                        "STRING parameter is not 7-bit ASCII".into(),
                    ));
                }
                let s = String::from_utf8(body.to_vec())
                    .map_err(|_| TseError::Framing("STRING parameter is not valid ASCII".into()))?;
                Ok(TypedParam::String(s))
            }
            TAG_LONG_ARRAY => {
                ensure_remaining(buf, 4)?;
                let marker = buf.get_u16();
                if marker != 0x0002 {
                    return Err(TseError::Framing(
                        "LONG_ARRAY parameter has a malformed length marker".into(),
                    ));
                }
                let byte_len = buf.get_u16() as usize;
                if byte_len % 4 != 0 {
                    return Err(TseError::Framing(
                        "LONG_ARRAY byte length is not a multiple of 4".into(),
                    ));
                }
                ensure_remaining(buf, byte_len)?;
                let count = byte_len / 4;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(buf.get_u32());
                }
                Ok(TypedParam::LongArray(values))
            }
            other => Err(TseError::Framing(format!(
                "unknown typed-parameter tag 0x{other:02X}"
            ))),
        }
    }
}

/// Encodes a sequence of typed parameters back-to-back.
pub fn encode_params(params: &[TypedParam]) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    for param in params {
        param.encode(&mut buf)?;
    }
    Ok(buf.to_vec())
}

/// Decodes a sequence of typed parameters that exactly fills `bytes`.
pub fn decode_params(mut bytes: Bytes) -> Result<Vec<TypedParam>> {
    let mut params = Vec::new();
    while bytes.has_remaining() {
        params.push(TypedParam::decode(&mut bytes)?);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_array_round_trips() {
        let params = vec![TypedParam::ByteArray(b"1234567890".to_vec())];
        let encoded = encode_params(&params).unwrap();
        assert_eq!(decode_params(Bytes::from(encoded)).unwrap(), params);
    }

    #[test]
    fn mixed_sequence_round_trips() {
        let params = vec![
            TypedParam::String("1.0".to_string()),
            TypedParam::ByteArray(vec![1, 2, 3, 4]),
            TypedParam::Byte(7),
            TypedParam::Short(0x1234),
            TypedParam::LongArray(vec![1, 2, 3]),
        ];
        let encoded = encode_params(&params).unwrap();
        assert_eq!(decode_params(Bytes::from(encoded)).unwrap(), params);
    }

    #[test]
    fn string_parameter_encodes_as_ascii_body() {
        let params = vec![TypedParam::String("Admin".to_string())];
        let encoded = encode_params(&params).unwrap();
        assert_eq!(encoded, vec![0x04, 0x00, 0x05, b'A', b'd', b'm', b'i', b'n']);
    }

    #[test]
    fn non_ascii_string_is_rejected_before_any_io() {
        let params = vec![TypedParam::String("Admin\u{00e9}".to_string())];
        assert!(encode_params(&params).is_err());
    }

    #[test]
    fn long_array_length_must_be_divisible_by_four() {
        // Declares a 6-byte body, which cannot hold whole 4-byte elements.
        let mut bytes = BytesMut::new();
        bytes.put_u8(TAG_LONG_ARRAY);
        bytes.put_u16(0x0002);
        bytes.put_u16(6);
        bytes.put_slice(&[0u8; 6]);
        let result = decode_params(bytes.freeze());
        assert!(result.is_err());
    }

    #[test]
    fn unknown_tag_is_a_framing_error() {
        let bytes = Bytes::from_static(&[0xAA]);
        assert!(decode_params(bytes).is_err());
    }
}
