//! Frame Protocol
//!
//! Wire format for messages crossing the worker boundary. Every request,
//! response and event is serialized into its own frame before it leaves one
//! context and parsed again on the other side, so nothing but bytes is ever
//! shared. The worker channels carry exactly one frame per message, so a
//! frame is always decoded whole.
//!
//! # Frame Format
//!
//! ```text
//!  0        4        8
//! +--------+--------+---------------------------+
//! | length | crc32  | JSON payload              |
//! | u32 BE | u32 BE | Request/Response/Event    |
//! +--------+--------+---------------------------+
//! ```
//!
//! `length` counts the payload bytes only.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Largest payload a frame may carry
///
/// Card decks and drum images travel as file contents, so this is generous.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Serialize a message into one frame
///
/// # Errors
///
/// `SerializationError` when the message cannot be turned into JSON,
/// `FrameTooLarge` when the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_FRAME_SIZE)
        .ok_or(TransportError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse one complete frame
///
/// # Errors
///
/// `FrameLength` when the bytes do not hold exactly the announced payload,
/// `FrameTooLarge`, `ChecksumMismatch` or `SerializationError` otherwise.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    let short = || TransportError::FrameLength {
        declared: None,
        received: frame.len(),
    };
    if frame.len() < HEADER_LEN {
        return Err(short());
    }
    let (header, payload) = frame.split_at(HEADER_LEN);
    let (len, crc) = header.split_at(4);
    let len = u32::from_be_bytes(len.try_into().map_err(|_| short())?) as usize;
    let expected = u32::from_be_bytes(crc.try_into().map_err(|_| short())?);

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    if payload.len() != len {
        return Err(TransportError::FrameLength {
            declared: Some(len),
            received: payload.len(),
        });
    }

    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(TransportError::ChecksumMismatch { expected, actual });
    }
    serde_json::from_slice(payload).map_err(|e| TransportError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterSnapshot;
    use crate::transport::messages::{Event, Request, WorkerMessage};

    fn raw_frame(len: usize, payload: &[u8]) -> Vec<u8> {
        let mut bytes = u32::try_from(len).unwrap().to_be_bytes().to_vec();
        bytes.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_request_survives_framing() {
        let request = Request::new(7, "examine", serde_json::json!({ "target": "AR" }));
        let decoded: Request = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_register_event_survives_framing() {
        let event = WorkerMessage::Event(Event::Registers {
            registers: RegisterSnapshot::default(),
        });
        let decoded: WorkerMessage = decode(&encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut encoded = encode(&Request::new(1, "stop", serde_json::Value::Null)).unwrap();
        let last = encoded.len() - 2;
        encoded[last] ^= 0x01;
        assert!(matches!(
            decode::<Request>(&encoded),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let encoded = encode(&Event::Runstate { running: false }).unwrap();
        assert!(matches!(
            decode::<Event>(&encoded[..5]),
            Err(TransportError::FrameLength { declared: None, received: 5 })
        ));
        assert!(matches!(
            decode::<Event>(&encoded[..encoded.len() - 1]),
            Err(TransportError::FrameLength { declared: Some(_), .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = encode(&Event::Runstate { running: true }).unwrap();
        encoded.push(b' ');
        assert!(matches!(
            decode::<Event>(&encoded),
            Err(TransportError::FrameLength { .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let frame = raw_frame(MAX_FRAME_SIZE + 1, b"");
        assert!(matches!(
            decode::<Request>(&frame),
            Err(TransportError::FrameTooLarge(len)) if len == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn test_valid_checksum_bad_json_rejected() {
        let payload = b"{\"id\": 1";
        assert!(matches!(
            decode::<Request>(&raw_frame(payload.len(), payload)),
            Err(TransportError::SerializationError(_))
        ));
    }
}
