//! Wire format between the CFS interposer and its collector.
//!
//! Every message is framed as a `u32` little-endian length followed by a
//! bincode-encoded [`CollectorMessage`]. A connection carries one `Hello`,
//! any number of `Event`s and, when the process exits cleanly, one `Goodbye`.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::PathBuf;

#[cfg(feature = "tokio")]
pub mod collector;

/// Frames larger than this are rejected on both ends.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Operation kinds. The numeric codes are stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OpKind {
    Create,
    Write,
    Read,
    Delete,
    Rename,
    Execute,
    Metadata,
}

impl OpKind {
    pub const fn code(self) -> u8 {
        match self {
            OpKind::Create => 1,
            OpKind::Write => 2,
            OpKind::Read => 3,
            OpKind::Delete => 5,
            OpKind::Rename => 6,
            OpKind::Execute => 8,
            OpKind::Metadata => 13,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => OpKind::Create,
            2 => OpKind::Write,
            3 => OpKind::Read,
            5 => OpKind::Delete,
            6 => OpKind::Rename,
            8 => OpKind::Execute,
            13 => OpKind::Metadata,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Write => "write",
            OpKind::Read => "read",
            OpKind::Delete => "delete",
            OpKind::Rename => "rename",
            OpKind::Execute => "execute",
            OpKind::Metadata => "metadata",
        }
    }
}

impl From<OpKind> for u8 {
    fn from(kind: OpKind) -> u8 {
        kind.code()
    }
}

impl TryFrom<u8> for OpKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        OpKind::from_code(code).ok_or_else(|| format!("unknown op code {}", code))
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the underlying call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// The call failed with this errno.
    Failure { errno: i32 },
    /// Recorded before a call that does not return on success (exec).
    Attempted,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// One in-tree access, as seen by the interposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub kind: OpKind,
    /// Canonical absolute path of the object accessed.
    #[serde(with = "path_bytes")]
    pub path: PathBuf,
    /// Destination of a rename.
    #[serde(with = "opt_path_bytes")]
    pub dest: Option<PathBuf>,
    pub outcome: Outcome,
    /// Byte count returned by read/write calls.
    pub bytes: Option<u64>,
    /// Nanoseconds since the Unix epoch at completion of the call.
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
}

/// Sent once per connection, before any event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub pid: u32,
    pub ppid: u32,
    #[serde(with = "path_bytes")]
    pub cwd: PathBuf,
    pub argv: Vec<Vec<u8>>,
}

/// Recorder counters, reported at exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped_full: u64,
    pub dropped_undeliverable: u64,
}

impl SessionStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_full + self.dropped_undeliverable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorMessage {
    Hello(ProgramInfo),
    Event(AccessEvent),
    Goodbye { pid: u32, stats: SessionStats },
}

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(message: &CollectorMessage) -> Result<Vec<u8>, IpcError> {
    let len = bincode::serialized_size(message)? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    bincode::serialize_into(&mut frame, message)?;
    Ok(frame)
}

/// Decode a frame payload (without the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<CollectorMessage, IpcError> {
    Ok(bincode::deserialize(payload)?)
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<CollectorMessage>, IpcError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_payload(&payload).map(Some)
}

/// Paths travel as raw bytes so non-UTF-8 names survive.
mod path_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::ffi::OsString;
    use std::os::unix::ffi::{OsStrExt, OsStringExt};
    use std::path::{Path, PathBuf};

    pub fn serialize<S: Serializer>(path: &Path, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(path.as_os_str().as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        Ok(PathBuf::from(OsString::from_vec(bytes)))
    }
}

mod opt_path_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::ffi::OsString;
    use std::os::unix::ffi::{OsStrExt, OsStringExt};
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        path.as_ref()
            .map(|p| p.as_os_str().as_bytes().to_vec())
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        let bytes = Option::<Vec<u8>>::deserialize(d)?;
        Ok(bytes.map(|b| PathBuf::from(OsString::from_vec(b))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    fn event(kind: OpKind, path: &str) -> AccessEvent {
        AccessEvent {
            kind,
            path: PathBuf::from(path),
            dest: None,
            outcome: Outcome::Success,
            bytes: None,
            timestamp_ns: 1,
            pid: 42,
            tid: 43,
        }
    }

    #[test]
    fn test_op_codes_are_stable() {
        assert_eq!(OpKind::Create.code(), 1);
        assert_eq!(OpKind::Write.code(), 2);
        assert_eq!(OpKind::Read.code(), 3);
        assert_eq!(OpKind::Delete.code(), 5);
        assert_eq!(OpKind::Rename.code(), 6);
        assert_eq!(OpKind::Execute.code(), 8);
        assert_eq!(OpKind::Metadata.code(), 13);
        assert_eq!(OpKind::from_code(4), None);
    }

    #[test]
    fn test_op_kind_serializes_as_code() {
        let bytes = bincode::serialize(&OpKind::Rename).unwrap();
        assert_eq!(bytes, vec![6]);
        assert!(bincode::deserialize::<OpKind>(&[4]).is_err());
        assert_eq!(serde_json::to_string(&OpKind::Metadata).unwrap(), "13");
    }

    #[test]
    fn test_frame_layout() {
        let msg = CollectorMessage::Event(event(OpKind::Create, "/build/out.o"));
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(decode_payload(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn test_read_frames_until_eof() {
        let mut stream = Vec::new();
        stream.extend(encode_frame(&CollectorMessage::Event(event(OpKind::Read, "/a"))).unwrap());
        stream.extend(
            encode_frame(&CollectorMessage::Goodbye {
                pid: 42,
                stats: SessionStats::default(),
            })
            .unwrap(),
        );

        let mut reader = stream.as_slice();
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Some(CollectorMessage::Event(_))
        ));
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Some(CollectorMessage::Goodbye { pid: 42, .. })
        ));
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut stream = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes().to_vec();
        stream.extend_from_slice(&[0; 8]);
        let err = read_frame(&mut stream.as_slice()).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge(_)));
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let frame = encode_frame(&CollectorMessage::Event(event(OpKind::Write, "/b"))).unwrap();
        let err = read_frame(&mut &frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, IpcError::Io(_)));
    }

    #[test]
    fn test_non_utf8_path_survives() {
        let raw = OsStr::from_bytes(b"/build/\xff\xfe.o");
        let mut ev = event(OpKind::Rename, "/");
        ev.path = PathBuf::from(raw);
        ev.dest = Some(PathBuf::from("/build/final.o"));

        let frame = encode_frame(&CollectorMessage::Event(ev.clone())).unwrap();
        assert_eq!(
            decode_payload(&frame[4..]).unwrap(),
            CollectorMessage::Event(ev)
        );
    }

    #[test]
    fn test_stats_dropped_total() {
        let stats = SessionStats {
            enqueued: 10,
            delivered: 6,
            dropped_full: 1,
            dropped_undeliverable: 3,
        };
        assert_eq!(stats.dropped(), 4);
    }
}
