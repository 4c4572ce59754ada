//! Minimal BACnet/IP framing for the one exchange the agent performs:
//! a confirmed ReadProperty request and its complex acknowledgement.
//!
//! Layers, outermost first: BVLC (type 0x81, original-unicast-NPDU), NPDU
//! (version 1, expecting-reply on requests), APDU. Only the application tags
//! a meter can answer with are decoded.

use anyhow::{
    bail,
    Context as _,
};

use crate::types::{
    BacnetValue,
    ReadRequest,
};

const BVLC_TYPE: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0a;
const NPDU_VERSION: u8 = 0x01;
const NPDU_EXPECTING_REPLY: u8 = 0x04;
const APDU_CONFIRMED_REQUEST: u8 = 0x00;
const APDU_COMPLEX_ACK: u8 = 0x30;
const APDU_ERROR: u8 = 0x50;
const APDU_REJECT: u8 = 0x60;
const APDU_ABORT: u8 = 0x70;
// Unsegmented, max APDU 1476 octets.
const MAX_APDU_1476: u8 = 0x05;
const SERVICE_READ_PROPERTY: u8 = 0x0c;

pub fn encode_read_property(invoke_id: u8, request: &ReadRequest) -> Vec<u8> {
    let mut apdu = vec![
        APDU_CONFIRMED_REQUEST,
        MAX_APDU_1476,
        invoke_id,
        SERVICE_READ_PROPERTY,
    ];
    // Context tag 0: object identifier, 10-bit type + 22-bit instance.
    let object_id = (u32::from(request.object_type.code()) << 22) | (request.instance & 0x003f_ffff);
    apdu.push(0x0c);
    apdu.extend_from_slice(&object_id.to_be_bytes());
    // Context tag 1: property identifier, enumerated.
    let property = request.property.code();
    if property <= 0xff {
        apdu.push(0x19);
        apdu.push(property as u8);
    } else {
        apdu.push(0x1a);
        apdu.extend_from_slice(&(property as u16).to_be_bytes());
    }

    let mut frame = Vec::with_capacity(apdu.len() + 6);
    frame.push(BVLC_TYPE);
    frame.push(BVLC_ORIGINAL_UNICAST);
    let length = (apdu.len() + 6) as u16;
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(NPDU_VERSION);
    frame.push(NPDU_EXPECTING_REPLY);
    frame.extend_from_slice(&apdu);
    frame
}

/// Decodes a response frame, returning the invoke id it answers and the
/// outcome for that request: the value, or the peer's Error/Reject/Abort.
/// The outer error means the frame cannot be attributed to any invoke id;
/// callers skip such frames rather than failing an unrelated request.
pub fn decode_read_property_ack(
    frame: &[u8],
) -> anyhow::Result<(u8, anyhow::Result<BacnetValue>)> {
    anyhow::ensure!(frame.len() >= 6, "frame too short for BVLC header");
    anyhow::ensure!(frame[0] == BVLC_TYPE, "not a BACnet/IP frame");
    let bvlc_len = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
    anyhow::ensure!(bvlc_len == frame.len(), "BVLC length mismatch");

    let npdu = &frame[4..];
    anyhow::ensure!(npdu.len() >= 2, "frame too short for NPDU");
    anyhow::ensure!(npdu[0] == NPDU_VERSION, "unsupported NPDU version");
    let control = npdu[1];
    let mut offset = 2;
    // Skip source/destination network addressing if present.
    if control & 0x20 != 0 {
        anyhow::ensure!(npdu.len() > offset + 2, "truncated NPDU destination");
        let dlen = usize::from(npdu[offset + 2]);
        offset += 3 + dlen;
    }
    if control & 0x08 != 0 {
        anyhow::ensure!(npdu.len() > offset + 2, "truncated NPDU source");
        let slen = usize::from(npdu[offset + 2]);
        offset += 3 + slen;
    }
    if control & 0x20 != 0 {
        // Hop count follows the addresses when a destination is present.
        offset += 1;
    }
    anyhow::ensure!(npdu.len() > offset, "frame too short for APDU");
    let apdu = &npdu[offset..];

    match apdu[0] & 0xf0 {
        APDU_COMPLEX_ACK => {
            anyhow::ensure!(apdu.len() >= 3, "truncated ComplexAck");
            Ok((apdu[1], decode_ack_body(&apdu[2..])))
        },
        APDU_ERROR => {
            anyhow::ensure!(apdu.len() >= 3, "truncated Error PDU");
            Ok((apdu[1], Err(anyhow::anyhow!("device returned Error PDU"))))
        },
        APDU_REJECT => {
            anyhow::ensure!(apdu.len() >= 3, "truncated Reject PDU");
            Ok((
                apdu[1],
                Err(anyhow::anyhow!("device rejected request (reason {})", apdu[2])),
            ))
        },
        APDU_ABORT => {
            anyhow::ensure!(apdu.len() >= 3, "truncated Abort PDU");
            Ok((
                apdu[1],
                Err(anyhow::anyhow!("device aborted request (reason {})", apdu[2])),
            ))
        },
        other => bail!("unexpected APDU type {other:#x}"),
    }
}

// objectIdentifier (context 0), propertyIdentifier (context 1), optional
// propertyArrayIndex (context 2), then the value in context tag 3.
fn decode_ack_body(body: &[u8]) -> anyhow::Result<BacnetValue> {
    anyhow::ensure!(
        body.first() == Some(&SERVICE_READ_PROPERTY),
        "unexpected service choice {:?}",
        body.first()
    );
    let mut cursor = &body[1..];
    cursor = skip_context_tag(cursor, 0)?;
    cursor = skip_context_tag(cursor, 1)?;
    if cursor.first().is_some_and(|b| b >> 4 == 2 && b & 0x08 != 0) {
        cursor = skip_context_tag(cursor, 2)?;
    }
    anyhow::ensure!(
        cursor.first() == Some(&0x3e),
        "missing opening tag for property value"
    );
    let (value, rest) = decode_application_value(&cursor[1..])?;
    anyhow::ensure!(
        rest.first() == Some(&0x3f),
        "missing closing tag for property value"
    );
    Ok(value)
}

fn skip_context_tag(buf: &[u8], expected: u8) -> anyhow::Result<&[u8]> {
    let tag = *buf.first().context("truncated context tag")?;
    anyhow::ensure!(
        tag >> 4 == expected && tag & 0x08 != 0,
        "expected context tag {expected}, got {tag:#x}"
    );
    let len = usize::from(tag & 0x07);
    anyhow::ensure!(len < 5, "oversized context tag {expected}");
    anyhow::ensure!(buf.len() > len, "truncated context tag {expected}");
    Ok(&buf[1 + len..])
}

fn decode_application_value(buf: &[u8]) -> anyhow::Result<(BacnetValue, &[u8])> {
    let tag = *buf.first().context("truncated application tag")?;
    anyhow::ensure!(tag & 0x08 == 0, "expected an application tag");
    let tag_number = tag >> 4;
    let mut len = usize::from(tag & 0x07);
    let mut data = &buf[1..];
    if len == 5 {
        // Extended length in the next octet.
        len = usize::from(*data.first().context("truncated extended length")?);
        data = &data[1..];
    }
    anyhow::ensure!(data.len() >= len, "truncated value payload");
    let (payload, rest) = data.split_at(len);
    let value = match tag_number {
        0 => BacnetValue::Null,
        1 => BacnetValue::Boolean(tag & 0x07 == 1),
        2 => BacnetValue::Unsigned(be_uint(payload)?),
        3 => BacnetValue::Signed(be_int(payload)?),
        4 => {
            anyhow::ensure!(len == 4, "Real must be 4 octets");
            BacnetValue::Real(f32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]))
        },
        5 => {
            anyhow::ensure!(len == 8, "Double must be 8 octets");
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(payload);
            BacnetValue::Double(f64::from_be_bytes(bytes))
        },
        9 => BacnetValue::Enumerated(u32::try_from(be_uint(payload)?)?),
        other => bail!("unsupported application tag {other}"),
    };
    // Boolean encodes its value in the length field and carries no payload.
    if tag_number == 1 {
        return Ok((value, &buf[1..]));
    }
    Ok((value, rest))
}

fn be_uint(payload: &[u8]) -> anyhow::Result<u64> {
    anyhow::ensure!(!payload.is_empty() && payload.len() <= 8, "bad uint width");
    let mut v = 0u64;
    for b in payload {
        v = (v << 8) | u64::from(*b);
    }
    Ok(v)
}

fn be_int(payload: &[u8]) -> anyhow::Result<i64> {
    anyhow::ensure!(!payload.is_empty() && payload.len() <= 8, "bad int width");
    let negative = payload[0] & 0x80 != 0;
    let mut v: i64 = if negative { -1 } else { 0 };
    for b in payload {
        v = (v << 8) | i64::from(*b);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::{
        ObjectType,
        PropertyId,
    };

    fn present_value_request(instance: u32) -> ReadRequest {
        ReadRequest {
            object_type: ObjectType::AnalogInput,
            instance,
            property: PropertyId::PresentValue,
        }
    }

    #[test]
    fn encodes_read_property_frame() {
        let frame = encode_read_property(7, &present_value_request(42));
        assert_eq!(
            frame,
            vec![
                0x81, 0x0a, 0x00, 0x11, // BVLC, length 17
                0x01, 0x04, // NPDU
                0x00, 0x05, 0x07, 0x0c, // confirmed request, invoke 7, ReadProperty
                0x0c, 0x00, 0x00, 0x00, 0x2a, // object id: analog-input 42
                0x19, 0x55, // property: present-value
            ]
        );
    }

    fn ack_frame(invoke_id: u8, value_bytes: &[u8]) -> Vec<u8> {
        let mut apdu = vec![0x30, invoke_id, 0x0c];
        apdu.extend_from_slice(&[0x0c, 0x00, 0x00, 0x00, 0x2a]); // object id
        apdu.extend_from_slice(&[0x19, 0x55]); // property id
        apdu.push(0x3e);
        apdu.extend_from_slice(value_bytes);
        apdu.push(0x3f);
        let mut frame = vec![0x81, 0x0a];
        frame.extend_from_slice(&((apdu.len() + 6) as u16).to_be_bytes());
        frame.extend_from_slice(&[0x01, 0x00]);
        frame.extend_from_slice(&apdu);
        frame
    }

    #[test]
    fn decodes_real_ack() {
        let frame = ack_frame(9, &[0x44, 0x46, 0x40, 0xe6, 0xbf]); // 12345.679f32
        let (invoke_id, outcome) = decode_read_property_ack(&frame).unwrap();
        assert_eq!(invoke_id, 9);
        let value = outcome.unwrap();
        let BacnetValue::Real(v) = value else {
            panic!("expected Real, got {value:?}");
        };
        assert!((f64::from(v) - 12345.679).abs() < 0.001);
    }

    #[test]
    fn decodes_unsigned_and_enumerated() {
        let frame = ack_frame(1, &[0x21, 0x2a]);
        assert_eq!(
            decode_read_property_ack(&frame).unwrap().1.unwrap(),
            BacnetValue::Unsigned(42)
        );
        let frame = ack_frame(1, &[0x91, 0x03]);
        assert_eq!(
            decode_read_property_ack(&frame).unwrap().1.unwrap(),
            BacnetValue::Enumerated(3)
        );
    }

    // An Error PDU still decodes far enough to name the request it answers,
    // so a stale one can be skipped instead of failing the in-flight read.
    #[test]
    fn error_pdu_is_attributed_to_its_invoke_id() {
        let mut frame = vec![0x81, 0x0a, 0x00, 0x09, 0x01, 0x00];
        frame.extend_from_slice(&[0x50, 0x07, 0x0c]);
        let (invoke_id, outcome) = decode_read_property_ack(&frame).unwrap();
        assert_eq!(invoke_id, 7);
        assert!(outcome.unwrap_err().to_string().contains("Error PDU"));
    }

    #[test]
    fn reject_pdu_carries_its_reason() {
        let mut frame = vec![0x81, 0x0a, 0x00, 0x09, 0x01, 0x00];
        frame.extend_from_slice(&[0x60, 0x03, 0x05]);
        let (invoke_id, outcome) = decode_read_property_ack(&frame).unwrap();
        assert_eq!(invoke_id, 3);
        assert!(outcome.unwrap_err().to_string().contains("reason 5"));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut frame = ack_frame(3, &[0x21, 0x01]);
        frame[3] = frame[3].wrapping_add(1);
        assert!(decode_read_property_ack(&frame).is_err());
    }

    #[test]
    fn round_trips_through_the_wire_layout() {
        let request = present_value_request(1);
        let encoded = encode_read_property(33, &request);
        // The request parses back far enough to find its own invoke id.
        assert_eq!(encoded[8], 33);
        assert_eq!(usize::from(u16::from_be_bytes([encoded[2], encoded[3]])), encoded.len());
    }
}
