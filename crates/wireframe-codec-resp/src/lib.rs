//! RESP (the Redis wire protocol) codec, per spec.md §4.3 and §9: the
//! `input` scan treats an unrecognized leading type byte as a fatal framing
//! error rather than silently flushing the buffer — the source's behavior
//! here was ambiguous between "intentional flush" and "latent bug"; this
//! port resolves it toward the stricter, fail-closed reading.

use wireframe_codec::{DecodedMessage, FrameCodec, FrameLength};
use wireframe_core::error::{CoreError, ErrorKind};

/// A parsed RESP reply, tagged by its wire-format leading byte.
#[derive(Clone, Debug, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// The leading type byte this value serializes under.
    pub fn kind(&self) -> char {
        match self {
            RespValue::Simple(_) => '+',
            RespValue::Error(_) => '-',
            RespValue::Integer(_) => ':',
            RespValue::Bulk(_) => '$',
            RespValue::Array(_) => '*',
        }
    }
}

fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    buf[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| start + i)
}

/// Scans one RESP value starting at `pos`, returning the position just
/// past it on success. `Ok(None)` means the buffer doesn't yet hold a
/// complete value; `Err(())` means the input can never be valid RESP.
fn scan_one(buf: &[u8], pos: usize) -> Result<Option<usize>, ()> {
    if pos >= buf.len() {
        return Ok(None);
    }
    match buf[pos] {
        b'+' | b'-' | b':' => match find_crlf(buf, pos + 1) {
            Some(crlf) => Ok(Some(crlf + 2)),
            None => Ok(None),
        },
        b'$' => {
            let Some(crlf) = find_crlf(buf, pos + 1) else {
                return Ok(None);
            };
            let len: i64 = std::str::from_utf8(&buf[pos + 1..crlf])
                .map_err(|_| ())?
                .parse()
                .map_err(|_| ())?;
            if len < 0 {
                if len != -1 {
                    return Err(());
                }
                return Ok(Some(crlf + 2));
            }
            let data_start = crlf + 2;
            let data_end = data_start + len as usize;
            let total_end = data_end + 2;
            if buf.len() < total_end {
                return Ok(None);
            }
            if &buf[data_end..total_end] != b"\r\n" {
                return Err(());
            }
            Ok(Some(total_end))
        }
        b'*' => {
            let Some(crlf) = find_crlf(buf, pos + 1) else {
                return Ok(None);
            };
            let count: i64 = std::str::from_utf8(&buf[pos + 1..crlf])
                .map_err(|_| ())?
                .parse()
                .map_err(|_| ())?;
            if count < 0 {
                if count != -1 {
                    return Err(());
                }
                return Ok(Some(crlf + 2));
            }
            let mut cursor = crlf + 2;
            for _ in 0..count {
                match scan_one(buf, cursor)? {
                    Some(next) => cursor = next,
                    None => return Ok(None),
                }
            }
            Ok(Some(cursor))
        }
        _ => Err(()),
    }
}

/// Parses one value out of `buf` at `pos`, trusting that [`scan_one`] has
/// already validated the framing up to the returned end position.
fn parse_one(buf: &[u8], pos: usize) -> (RespValue, usize) {
    match buf[pos] {
        b'+' => {
            let crlf = find_crlf(buf, pos + 1).expect("validated by scan_one");
            let s = String::from_utf8_lossy(&buf[pos + 1..crlf]).into_owned();
            (RespValue::Simple(s), crlf + 2)
        }
        b'-' => {
            let crlf = find_crlf(buf, pos + 1).expect("validated by scan_one");
            let s = String::from_utf8_lossy(&buf[pos + 1..crlf]).into_owned();
            (RespValue::Error(s), crlf + 2)
        }
        b':' => {
            let crlf = find_crlf(buf, pos + 1).expect("validated by scan_one");
            let n: i64 = std::str::from_utf8(&buf[pos + 1..crlf])
                .unwrap()
                .parse()
                .unwrap();
            (RespValue::Integer(n), crlf + 2)
        }
        b'$' => {
            let crlf = find_crlf(buf, pos + 1).expect("validated by scan_one");
            let len: i64 = std::str::from_utf8(&buf[pos + 1..crlf])
                .unwrap()
                .parse()
                .unwrap();
            if len < 0 {
                return (RespValue::Bulk(None), crlf + 2);
            }
            let data_start = crlf + 2;
            let data_end = data_start + len as usize;
            let data = buf[data_start..data_end].to_vec();
            (RespValue::Bulk(Some(data)), data_end + 2)
        }
        b'*' => {
            let crlf = find_crlf(buf, pos + 1).expect("validated by scan_one");
            let count: i64 = std::str::from_utf8(&buf[pos + 1..crlf])
                .unwrap()
                .parse()
                .unwrap();
            if count < 0 {
                return (RespValue::Array(None), crlf + 2);
            }
            let mut cursor = crlf + 2;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (value, next) = parse_one(buf, cursor);
                items.push(value);
                cursor = next;
            }
            (RespValue::Array(Some(items)), cursor)
        }
        other => unreachable!("scan_one would have rejected type byte {other}"),
    }
}

fn encode_value(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(data)) => {
            out.push(b'$');
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// Convenience encoder for the common "flat command array of bulk
/// strings" shape (`*N\r\n$len\r\nstr\r\n...`), per spec.md §4.3.
pub fn encode_command(parts: &[&str]) -> Vec<u8> {
    let items = parts
        .iter()
        .map(|p| RespValue::Bulk(Some(p.as_bytes().to_vec())))
        .collect();
    let mut out = Vec::new();
    encode_value(&RespValue::Array(Some(items)), &mut out);
    out
}

#[derive(Debug, Default)]
pub struct RespCodec;

impl RespCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for RespCodec {
    fn name(&self) -> &'static str {
        "resp"
    }

    fn input(&self, buffer: &[u8]) -> FrameLength {
        match scan_one(buffer, 0) {
            Ok(Some(n)) => FrameLength::Complete(n),
            Ok(None) => FrameLength::Incomplete,
            Err(()) => FrameLength::Fatal,
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<DecodedMessage, CoreError> {
        if scan_one(frame, 0) != Ok(Some(frame.len())) {
            return Err(CoreError::new(
                ErrorKind::ProtocolError,
                "frame is not a single complete RESP value",
            ));
        }
        let (value, _) = parse_one(frame, 0);
        Ok(Box::new(value))
    }

    fn encode(&self, message: &DecodedMessage) -> Result<Vec<u8>, CoreError> {
        let value = message
            .downcast_ref::<RespValue>()
            .ok_or_else(|| CoreError::new(ErrorKind::ProtocolError, "expected a RespValue"))?;
        let mut out = Vec::new();
        encode_value(value, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn array_of_bulk_with_nil_element() {
        let codec = RespCodec::new();
        let input = b"*2\r\n$3\r\nfoo\r\n$-1\r\n";
        assert_eq!(codec.input(input), FrameLength::Complete(19));
        let decoded = codec.decode(input).unwrap();
        let value = decoded.downcast_ref::<RespValue>().unwrap();
        assert_eq!(
            *value,
            RespValue::Array(Some(vec![
                RespValue::Bulk(Some(b"foo".to_vec())),
                RespValue::Bulk(None),
            ]))
        );
    }

    #[test]
    fn truncated_bulk_is_incomplete() {
        let codec = RespCodec::new();
        assert_eq!(codec.input(b"*2\r\n$3\r\nfo"), FrameLength::Incomplete);
    }

    #[test]
    fn unknown_type_byte_is_fatal() {
        let codec = RespCodec::new();
        assert_eq!(codec.input(b"&garbage\r\n"), FrameLength::Fatal);
    }

    #[test]
    fn simple_string_round_trips() {
        let codec = RespCodec::new();
        let input = b"+OK\r\n";
        assert_eq!(codec.input(input), FrameLength::Complete(5));
        let decoded = codec.decode(input).unwrap();
        let value = decoded.downcast_ref::<RespValue>().unwrap().clone();
        let encoded = codec.encode(&(Box::new(value) as DecodedMessage)).unwrap();
        assert_eq!(encoded, input);
    }

    #[test]
    fn split_buffer_is_incomplete_then_complete() {
        let codec = RespCodec::new();
        let full = b"*1\r\n$5\r\nhello\r\n".to_vec();
        let (a, b) = full.split_at(6);
        assert_eq!(codec.input(a), FrameLength::Incomplete);
        let mut combined = a.to_vec();
        combined.extend_from_slice(b);
        assert_eq!(codec.input(&combined), FrameLength::Complete(full.len()));
    }

    #[test]
    fn encode_command_builds_flat_array() {
        let encoded = encode_command(&["SET", "foo", "bar"]);
        assert_eq!(
            encoded,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec()
        );
    }

    /// Leaves avoid `\r` and `\n` so simple strings/errors stay well-formed;
    /// arrays recurse a few levels so `scan_one`'s own recursion gets
    /// exercised by generated input, not just the fixed examples above.
    fn arb_resp_value() -> impl Strategy<Value = RespValue> {
        let leaf = prop_oneof![
            "[a-zA-Z0-9 ]{0,16}".prop_map(RespValue::Simple),
            "[a-zA-Z0-9 ]{0,16}".prop_map(RespValue::Error),
            any::<i64>().prop_map(RespValue::Integer),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..16)).prop_map(RespValue::Bulk),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop::option::of(prop::collection::vec(inner, 0..4)).prop_map(RespValue::Array)
        })
    }

    proptest! {
        /// spec.md §8's round-trip law: encoding then decoding any value
        /// reproduces it exactly, and `input` reports the encoded length as
        /// one complete frame.
        #[test]
        fn round_trips_through_encode_decode(value in arb_resp_value()) {
            let codec = RespCodec::new();
            let mut bytes = Vec::new();
            encode_value(&value, &mut bytes);

            prop_assert_eq!(codec.input(&bytes), FrameLength::Complete(bytes.len()));

            let decoded = codec.decode(&bytes).unwrap();
            let decoded_value = decoded.downcast_ref::<RespValue>().unwrap();
            prop_assert_eq!(decoded_value, &value);

            let message: DecodedMessage = Box::new(decoded_value.clone());
            let reencoded = codec.encode(&message).unwrap();
            prop_assert_eq!(reencoded, bytes);
        }

        /// spec.md §8's split-point law: any strict prefix of an encoded
        /// frame is incomplete, and the full frame is complete at exactly
        /// its own length, regardless of where the cut falls.
        #[test]
        fn any_shorter_prefix_is_incomplete(value in arb_resp_value(), cut_fraction in 0usize..100) {
            let codec = RespCodec::new();
            let mut bytes = Vec::new();
            encode_value(&value, &mut bytes);

            if bytes.len() > 1 {
                let cut = 1 + (cut_fraction * (bytes.len() - 1)) / 100;
                prop_assert_eq!(codec.input(&bytes[..cut]), FrameLength::Incomplete);
            }
            prop_assert_eq!(codec.input(&bytes), FrameLength::Complete(bytes.len()));
        }
    }
}
