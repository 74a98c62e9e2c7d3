//! Wire protocol of the remote module channel.
//!
//! A frame is a length-prefixed payload carrying a protocol version, a YAML
//! document and a binary section:
//!
//! ```text
//! u32 LE payload length
//! u8  protocol version
//! u32 LE yaml length, yaml bytes
//! u32 LE blob length, blob bytes (packed little-endian f64)
//! ```
//!
//! Dense numeric sequences take a fast path: before serialization they are
//! lifted out of the YAML tree into the blob and replaced with a
//! `!f64seq [offset, count]` tagged node, which the receiving side resolves
//! back into a plain sequence. Everything else crosses the boundary as the
//! framework's YAML flavor, which makes every call by value: no live
//! reference survives the trip.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_yaml::value::{Tag, TaggedValue};

use crate::error::{CoreError, Result};
use crate::yaml::{as_f64_array, f64_array, Value};

pub const PROTOCOL_VERSION: u8 = 1;

/// Sequences shorter than this stay inline in the YAML document.
const F64_INLINE_MAX: usize = 32;

/// Frames larger than this are rejected as malformed.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

const F64_TAG: &str = "f64seq";

/// Client → server operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    ListRemotable,
    Acquire { module: String },
    Release { handle: u64 },
    Call { handle: u64, attr: String, args: Vec<Value> },
    GetAttr { handle: u64, attr: String },
    SetAttr { handle: u64, attr: String, value: Value },
}

/// Server → client results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Response {
    Remotable {
        modules: Vec<String>,
    },
    Acquired {
        handle: u64,
        module: String,
        interfaces: Vec<String>,
    },
    Released,
    Value {
        value: Value,
    },
    Done,
    Error {
        class: String,
        message: String,
        trace: Vec<String>,
    },
}

impl Response {
    /// Maps a framework error into its wire representation.
    pub fn from_error(err: &CoreError) -> Self {
        Response::Error {
            class: err.class_name().to_string(),
            message: err.to_string(),
            trace: vec![format!("{err:?}")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: u32,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: u32,
    #[serde(flatten)]
    pub response: Response,
}

/// Replaces qualifying numeric sequences with `!f64seq` references into the
/// blob. Walks the whole tree; nested arrays inside mappings and sequences
/// are lifted too.
fn lift_arrays(value: &mut Value, blob: &mut Vec<u8>) {
    if let Some(numbers) = as_f64_array(value) {
        if numbers.len() >= F64_INLINE_MAX {
            let offset = blob.len() / 8;
            for number in &numbers {
                blob.extend_from_slice(&number.to_le_bytes());
            }
            *value = Value::Tagged(Box::new(TaggedValue {
                tag: Tag::new(F64_TAG),
                value: Value::Sequence(vec![Value::from(offset as u64), Value::from(numbers.len() as u64)]),
            }));
            return;
        }
    }
    match value {
        Value::Sequence(items) => {
            for item in items {
                lift_arrays(item, blob);
            }
        }
        Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                lift_arrays(item, blob);
            }
        }
        _ => {}
    }
}

/// Resolves `!f64seq` references back into plain sequences.
fn restore_arrays(value: &mut Value, blob: &[u8]) -> Result<()> {
    let replacement = if let Value::Tagged(tagged) = value {
        if tagged.tag == Tag::new(F64_TAG) {
            let parts = as_f64_array(&tagged.value).ok_or_else(|| malformed("bad !f64seq node"))?;
            if parts.len() != 2 {
                return Err(malformed("bad !f64seq node"));
            }
            let (offset, count) = (parts[0] as usize, parts[1] as usize);
            let start = offset * 8;
            let end = start + count * 8;
            if end > blob.len() {
                return Err(malformed("!f64seq reference outside blob"));
            }
            let mut numbers = Vec::with_capacity(count);
            for chunk in blob[start..end].chunks_exact(8) {
                numbers.push(f64::from_le_bytes(chunk.try_into().expect("chunk size is 8")));
            }
            Some(f64_array(&numbers))
        } else {
            None
        }
    } else {
        None
    };
    if let Some(replacement) = replacement {
        *value = replacement;
        return Ok(());
    }
    match value {
        Value::Sequence(items) => {
            for item in items {
                restore_arrays(item, blob)?;
            }
        }
        Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                restore_arrays(item, blob)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn malformed(reason: &str) -> CoreError {
    CoreError::Transport {
        peer: "<frame>".to_string(),
        reason: reason.to_string(),
    }
}

/// Serializes a message into a complete frame, ready to write to a stream.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut value = serde_yaml::to_value(message)?;
    let mut blob = Vec::new();
    lift_arrays(&mut value, &mut blob);
    let yaml = serde_yaml::to_string(&value)?;

    let payload_len = 1 + 4 + yaml.len() + 4 + blob.len();
    let mut frame = Vec::with_capacity(4 + payload_len);
    frame.extend_from_slice(&(payload_len as u32).to_le_bytes());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(yaml.len() as u32).to_le_bytes());
    frame.extend_from_slice(yaml.as_bytes());
    frame.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    frame.extend_from_slice(&blob);
    Ok(frame)
}

/// Parses a payload (everything after the length prefix) into a message.
pub fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    if payload.len() < 9 {
        return Err(malformed("truncated frame"));
    }
    if payload[0] != PROTOCOL_VERSION {
        return Err(malformed("unsupported protocol version"));
    }
    let yaml_len = u32::from_le_bytes(payload[1..5].try_into().expect("slice size is 4")) as usize;
    let yaml_end = 5 + yaml_len;
    if payload.len() < yaml_end + 4 {
        return Err(malformed("yaml section exceeds frame"));
    }
    let yaml = std::str::from_utf8(&payload[5..yaml_end]).map_err(|_| malformed("yaml section is not UTF-8"))?;
    let blob_len =
        u32::from_le_bytes(payload[yaml_end..yaml_end + 4].try_into().expect("slice size is 4")) as usize;
    let blob_end = yaml_end + 4 + blob_len;
    if payload.len() != blob_end {
        return Err(malformed("blob section exceeds frame"));
    }
    let blob = &payload[yaml_end + 4..blob_end];

    let mut value: Value = serde_yaml::from_str(yaml)?;
    restore_arrays(&mut value, blob)?;
    Ok(serde_yaml::from_value(value)?)
}

/// Writes one message as a frame.
pub fn send<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one complete frame and decodes it.
pub fn recv<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T> {
    let mut length = [0u8; 4];
    reader.read_exact(&mut length)?;
    let payload_len = u32::from_le_bytes(length);
    if payload_len > MAX_FRAME {
        return Err(malformed("frame exceeds size limit"));
    }
    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;
    decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T>(message: &T) -> T
    where
        T: Serialize + for<'de> Deserialize<'de>,
    {
        let frame = encode(message).unwrap();
        let payload_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 4 + payload_len);
        decode(&frame[4..]).unwrap()
    }

    #[test]
    fn request_roundtrip() {
        let frame = RequestFrame {
            request_id: 42,
            request: Request::Call {
                handle: 7,
                attr: "acquire_frame".to_string(),
                args: vec![Value::from(3), Value::from("fast")],
            },
        };
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.request_id, 42);
        match decoded.request {
            Request::Call { handle, attr, args } => {
                assert_eq!(handle, 7);
                assert_eq!(attr, "acquire_frame");
                assert_eq!(args, vec![Value::from(3), Value::from("fast")]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn dense_array_takes_blob_fast_path() {
        let samples: Vec<f64> = (0..4096).map(|i| i as f64 * 0.5).collect();
        let frame = ResponseFrame {
            request_id: 1,
            response: Response::Value {
                value: f64_array(&samples),
            },
        };
        let encoded = encode(&frame).unwrap();
        // The YAML section must not spell out thousands of scalars.
        let yaml_len = u32::from_le_bytes(encoded[5..9].try_into().unwrap()) as usize;
        assert!(yaml_len < 1024, "yaml section unexpectedly large: {yaml_len}");

        let decoded: ResponseFrame = decode(&encoded[4..]).unwrap();
        match decoded.response {
            Response::Value { value } => assert_eq!(as_f64_array(&value).unwrap(), samples),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn nested_arrays_are_lifted_too() {
        let inner: Vec<f64> = (0..100).map(f64::from).collect();
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(Value::from("frame"), f64_array(&inner));
        mapping.insert(Value::from("label"), Value::from("scan"));
        let frame = ResponseFrame {
            request_id: 2,
            response: Response::Value {
                value: Value::Mapping(mapping),
            },
        };
        let decoded = roundtrip(&frame);
        match decoded.response {
            Response::Value { value } => {
                assert_eq!(as_f64_array(&value["frame"]).unwrap(), inner);
                assert_eq!(value["label"], Value::from("scan"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn short_arrays_stay_inline() {
        let short: Vec<f64> = vec![1.0, 2.0, 3.0];
        let frame = ResponseFrame {
            request_id: 3,
            response: Response::Value {
                value: f64_array(&short),
            },
        };
        let encoded = encode(&frame).unwrap();
        let blob_start = encoded.len() - 4;
        let blob_len = u32::from_le_bytes(encoded[blob_start..].try_into().unwrap());
        assert_eq!(blob_len, 0);
        let decoded: ResponseFrame = decode(&encoded[4..]).unwrap();
        match decoded.response {
            Response::Value { value } => assert_eq!(as_f64_array(&value).unwrap(), short),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn error_response_carries_class_and_message() {
        let err = CoreError::NotRemotable {
            module: "hw_a".to_string(),
        };
        let response = Response::from_error(&err);
        match &response {
            Response::Error { class, message, trace } => {
                assert_eq!(class, "NotRemotable");
                assert!(message.contains("hw_a"));
                assert!(!trace.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
        let decoded = roundtrip(&ResponseFrame {
            request_id: 9,
            response,
        });
        assert!(matches!(decoded.response, Response::Error { .. }));
    }

    #[test]
    fn stream_send_and_recv() {
        let mut buffer = Vec::new();
        let message = RequestFrame {
            request_id: 5,
            request: Request::ListRemotable,
        };
        send(&mut buffer, &message).unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let decoded: RequestFrame = recv(&mut cursor).unwrap();
        assert_eq!(decoded.request_id, 5);
        assert!(matches!(decoded.request, Request::ListRemotable));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(decode::<RequestFrame>(&[PROTOCOL_VERSION, 0, 0]).is_err());
        assert!(decode::<RequestFrame>(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
