//! Backup protocol: message kinds, header fields and identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent in every header as `D.D`.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Maximum chunk body in bytes (64000, not 64 KiB).
pub const MAX_CHUNK_SIZE: usize = 64_000;

/// Largest chunk number the grammar admits (six decimal digits).
pub const MAX_CHUNK_NO: u32 = 999_999;

/// Replication degree is a single non-zero digit on the wire.
pub const MAX_REPLICATION_DEGREE: u8 = 9;

/// Protocol version, one digit before and after the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = InvalidField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [a, b'.', b] if a.is_ascii_digit() && b.is_ascii_digit() => Ok(Self {
                major: a - b'0',
                minor: b - b'0',
            }),
            _ => Err(InvalidField::Version),
        }
    }
}

/// Peer identifier (positive integer, unique within the multicast group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = InvalidField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidField::SenderId);
        }
        match s.parse::<u32>() {
            Ok(0) | Err(_) => Err(InvalidField::SenderId),
            Ok(id) => Ok(PeerId(id)),
        }
    }
}

/// File identifier: SHA-256 digest, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId([u8; 32]);

impl FileId {
    pub fn from_digest(digest: [u8; 32]) -> Self {
        FileId(digest)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self)
    }
}

impl FromStr for FileId {
    type Err = InvalidField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 64 {
            return Err(InvalidField::FileId);
        }
        let mut out = [0u8; 32];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            out[i] = (hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?;
        }
        Ok(FileId(out))
    }
}

fn hex_nibble(c: u8) -> Result<u8, InvalidField> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(InvalidField::FileId),
    }
}

/// A header field that failed its shape or range check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidField {
    #[error("protocol version must be D.D")]
    Version,
    #[error("sender id must be a positive integer")]
    SenderId,
    #[error("file id must be 64 lowercase hex characters")]
    FileId,
    #[error("chunk number must be 1 to 6 digits")]
    ChunkNo,
    #[error("replication degree must be a single digit 1-9")]
    ReplicationDegree,
}

/// Fields common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub sender_id: PeerId,
    pub file_id: FileId,
}

impl Header {
    pub fn new(version: Version, sender_id: PeerId, file_id: FileId) -> Self {
        Self {
            version,
            sender_id,
            file_id,
        }
    }
}

/// Wire message kind; the leading token of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PutChunk,
    Stored,
    GetChunk,
    Chunk,
    Delete,
    Removed,
    CheckDelete,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::PutChunk,
        MessageKind::Stored,
        MessageKind::GetChunk,
        MessageKind::Chunk,
        MessageKind::Delete,
        MessageKind::Removed,
        MessageKind::CheckDelete,
    ];

    pub fn token(self) -> &'static str {
        match self {
            MessageKind::PutChunk => "PUTCHUNK",
            MessageKind::Stored => "STORED",
            MessageKind::GetChunk => "GETCHUNK",
            MessageKind::Chunk => "CHUNK",
            MessageKind::Delete => "DELETE",
            MessageKind::Removed => "REMOVED",
            MessageKind::CheckDelete => "CHECKDELETE",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.token() == token)
    }

    /// Kinds followed by a binary body after the header terminator.
    pub fn has_body(self) -> bool {
        matches!(self, MessageKind::PutChunk | MessageKind::Chunk)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// All wire messages. Encoding is the ASCII header grammar; see the wire module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask peers to store a chunk at the given replication degree.
    PutChunk {
        header: Header,
        chunk_no: u32,
        replication_degree: u8,
        body: Vec<u8>,
    },
    /// A peer now stores the chunk.
    Stored { header: Header, chunk_no: u32 },
    /// Ask a holder to send the chunk back.
    GetChunk { header: Header, chunk_no: u32 },
    /// Chunk payload in answer to GETCHUNK.
    Chunk {
        header: Header,
        chunk_no: u32,
        body: Vec<u8>,
    },
    /// Every chunk of the file should be dropped.
    Delete { header: Header },
    /// A peer dropped its copy of the chunk.
    Removed { header: Header, chunk_no: u32 },
    /// Ask whether the file has been deleted while the asker was away.
    CheckDelete { header: Header },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PutChunk { .. } => MessageKind::PutChunk,
            Message::Stored { .. } => MessageKind::Stored,
            Message::GetChunk { .. } => MessageKind::GetChunk,
            Message::Chunk { .. } => MessageKind::Chunk,
            Message::Delete { .. } => MessageKind::Delete,
            Message::Removed { .. } => MessageKind::Removed,
            Message::CheckDelete { .. } => MessageKind::CheckDelete,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Message::PutChunk { header, .. }
            | Message::Stored { header, .. }
            | Message::GetChunk { header, .. }
            | Message::Chunk { header, .. }
            | Message::Delete { header }
            | Message::Removed { header, .. }
            | Message::CheckDelete { header } => header,
        }
    }

    pub fn sender_id(&self) -> PeerId {
        self.header().sender_id
    }

    pub fn file_id(&self) -> FileId {
        self.header().file_id
    }

    /// Chunk number for chunk-scoped kinds; `None` for DELETE and CHECKDELETE.
    pub fn chunk_no(&self) -> Option<u32> {
        match self {
            Message::PutChunk { chunk_no, .. }
            | Message::Stored { chunk_no, .. }
            | Message::GetChunk { chunk_no, .. }
            | Message::Chunk { chunk_no, .. }
            | Message::Removed { chunk_no, .. } => Some(*chunk_no),
            Message::Delete { .. } | Message::CheckDelete { .. } => None,
        }
    }

    /// Whether this message concerns exactly (file_id, chunk_no).
    pub fn concerns(&self, file_id: &FileId, chunk_no: u32) -> bool {
        self.file_id() == *file_id && self.chunk_no() == Some(chunk_no)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.header();
        write!(f, "{} {} {} {}", self.kind(), h.version, h.sender_id, h.file_id)?;
        if let Some(n) = self.chunk_no() {
            write!(f, " {}", n)?;
        }
        if let Message::PutChunk {
            replication_degree, ..
        } = self
        {
            write!(f, " {}", replication_degree)?;
        }
        Ok(())
    }
}
