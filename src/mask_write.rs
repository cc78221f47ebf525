//! Mask Write Register (0x16) request/response PDUs.
//!
//! Request and response share one layout: the function code followed by
//! reference, AND mask and OR mask as big-endian words. The response echoes
//! the request and does not carry the resulting register value.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::process_image::Word;

pub const FUNCTION_CODE: u8 = 0x16;
pub const PDU_LEN: usize = 7;

/// `(current AND and_mask) OR (or_mask AND NOT and_mask)`
pub fn apply(current: Word, and_mask: Word, or_mask: Word) -> Word {
    (current & and_mask) | (or_mask & !and_mask)
}

fn word(field: &'static str, value: i64) -> Result<Word, CodecError> {
    Word::try_from(value).map_err(|_| CodecError::InvalidArgument { field, value })
}

/// Builds the wire PDU from unchecked integers.
pub fn encode(reference: i64, and_mask: i64, or_mask: i64) -> Result<Bytes, CodecError> {
    Ok(encode_words(
        word("reference", reference)?,
        word("andMask", and_mask)?,
        word("orMask", or_mask)?,
    ))
}

fn encode_words(reference: Word, and_mask: Word, or_mask: Word) -> Bytes {
    let mut buf = BytesMut::with_capacity(PDU_LEN);
    buf.put_u8(FUNCTION_CODE);
    buf.put_u16(reference);
    buf.put_u16(and_mask);
    buf.put_u16(or_mask);
    buf.freeze()
}

fn decode_words(mut pdu: &[u8]) -> Result<(Word, Word, Word), CodecError> {
    if pdu.len() != PDU_LEN {
        return Err(CodecError::MalformedMessage(format!(
            "expected {PDU_LEN} bytes, got {}",
            pdu.len()
        )));
    }
    let function_code = pdu.get_u8();
    if function_code != FUNCTION_CODE {
        return Err(CodecError::MalformedMessage(format!(
            "expected function code {FUNCTION_CODE:#04x}, got {function_code:#04x}"
        )));
    }
    Ok((pdu.get_u16(), pdu.get_u16(), pdu.get_u16()))
}

/// Parses a response PDU.
pub fn decode(pdu: &[u8]) -> Result<MaskWriteResponse, CodecError> {
    let (reference, and_mask, or_mask) = decode_words(pdu)?;
    Ok(MaskWriteResponse {
        reference,
        and_mask,
        or_mask,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskWriteRequest {
    pub unit_id: u8,
    pub reference: Word,
    pub and_mask: Word,
    pub or_mask: Word,
}

impl MaskWriteRequest {
    pub fn new(
        unit_id: u8,
        reference: i64,
        and_mask: i64,
        or_mask: i64,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            unit_id,
            reference: word("reference", reference)?,
            and_mask: word("andMask", and_mask)?,
            or_mask: word("orMask", or_mask)?,
        })
    }

    pub fn encode(&self) -> Bytes {
        encode_words(self.reference, self.and_mask, self.or_mask)
    }

    /// Parses a request PDU addressed to `unit_id`.
    pub fn decode(unit_id: u8, pdu: &[u8]) -> Result<Self, CodecError> {
        let (reference, and_mask, or_mask) = decode_words(pdu)?;
        Ok(Self {
            unit_id,
            reference,
            and_mask,
            or_mask,
        })
    }

    /// Value the addressed register takes when it currently holds `current`.
    pub fn apply(&self, current: Word) -> Word {
        apply(current, self.and_mask, self.or_mask)
    }

    /// The response a conforming device echoes back.
    pub fn expected_response(&self) -> MaskWriteResponse {
        MaskWriteResponse {
            reference: self.reference,
            and_mask: self.and_mask,
            or_mask: self.or_mask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskWriteResponse {
    pub reference: Word,
    pub and_mask: Word,
    pub or_mask: Word,
}

impl MaskWriteResponse {
    pub fn encode(&self) -> Bytes {
        encode_words(self.reference, self.and_mask, self.or_mask)
    }
}
