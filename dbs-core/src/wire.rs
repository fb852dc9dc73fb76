//! Wire grammar: `<TYPE> <D.D> <senderID> <fileID> [<chunkNo> [<degree>]] \r\n\r\n [body]`.
//!
//! One message per datagram. Parsing is exact: a header with the wrong field
//! count, a malformed field, or a body on a kind that carries none is rejected
//! as a whole.

use crate::protocol::{
    FileId, Header, InvalidField, Message, MessageKind, PeerId, Version, MAX_CHUNK_NO,
    MAX_CHUNK_SIZE, MAX_REPLICATION_DEGREE,
};

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Error parsing a received datagram. Always scoped to that one datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognized message type {0:?}")]
    UnrecognizedType(String),
    #[error("malformed message: {0}")]
    Malformed(Malformed),
}

impl From<InvalidField> for ParseError {
    fn from(e: InvalidField) -> Self {
        ParseError::Malformed(Malformed::Field(e))
    }
}

/// Why a datagram with a known (or missing) type token failed the grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error("missing header terminator")]
    MissingTerminator,
    #[error("header is not ASCII")]
    NotAscii,
    #[error("empty header")]
    Empty,
    #[error("{kind} expects {expected} fields, got {got}")]
    FieldCount {
        kind: MessageKind,
        expected: usize,
        got: usize,
    },
    #[error("{0}")]
    Field(InvalidField),
    #[error("{0} carries no body")]
    UnexpectedBody(MessageKind),
    #[error("body of {0} bytes exceeds chunk size")]
    BodyTooLarge(usize),
}

/// Error encoding an in-memory message whose fields are out of range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("sender id 0 is reserved")]
    SenderId,
    #[error("chunk number {0} out of range")]
    ChunkNo(u32),
    #[error("replication degree {0} out of range")]
    ReplicationDegree(u8),
    #[error("body of {0} bytes exceeds chunk size")]
    BodyTooLarge(usize),
}

/// Parse one received datagram into a typed message.
pub fn parse(bytes: &[u8]) -> Result<Message, ParseError> {
    let split = find_terminator(bytes);
    let (head, body) = match split {
        Some(at) => (&bytes[..at], &bytes[at + TERMINATOR.len()..]),
        None => (bytes, &[][..]),
    };
    let head = std::str::from_utf8(head)
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or(ParseError::Malformed(Malformed::NotAscii))?;
    let fields: Vec<&str> = head.split_ascii_whitespace().collect();
    let token = *fields.first().ok_or(ParseError::Malformed(Malformed::Empty))?;
    let kind = MessageKind::from_token(token)
        .ok_or_else(|| ParseError::UnrecognizedType(token.to_string()))?;
    if split.is_none() {
        return Err(ParseError::Malformed(Malformed::MissingTerminator));
    }

    let expected = field_count(kind);
    if fields.len() != expected {
        return Err(ParseError::Malformed(Malformed::FieldCount {
            kind,
            expected,
            got: fields.len(),
        }));
    }
    if !kind.has_body() && !body.is_empty() {
        return Err(ParseError::Malformed(Malformed::UnexpectedBody(kind)));
    }
    if body.len() > MAX_CHUNK_SIZE {
        return Err(ParseError::Malformed(Malformed::BodyTooLarge(body.len())));
    }

    let header = Header {
        version: fields[1].parse::<Version>()?,
        sender_id: fields[2].parse::<PeerId>()?,
        file_id: fields[3].parse::<FileId>()?,
    };
    let msg = match kind {
        MessageKind::PutChunk => Message::PutChunk {
            header,
            chunk_no: parse_chunk_no(fields[4])?,
            replication_degree: parse_degree(fields[5])?,
            body: body.to_vec(),
        },
        MessageKind::Stored => Message::Stored {
            header,
            chunk_no: parse_chunk_no(fields[4])?,
        },
        MessageKind::GetChunk => Message::GetChunk {
            header,
            chunk_no: parse_chunk_no(fields[4])?,
        },
        MessageKind::Chunk => Message::Chunk {
            header,
            chunk_no: parse_chunk_no(fields[4])?,
            body: body.to_vec(),
        },
        MessageKind::Delete => Message::Delete { header },
        MessageKind::Removed => Message::Removed {
            header,
            chunk_no: parse_chunk_no(fields[4])?,
        },
        MessageKind::CheckDelete => Message::CheckDelete { header },
    };
    Ok(msg)
}

/// Encode a message in canonical form: single spaces, a space before the terminator.
pub fn encode(msg: &Message) -> Result<Vec<u8>, BuildError> {
    let header = msg.header();
    if header.sender_id.0 == 0 {
        return Err(BuildError::SenderId);
    }
    if let Some(n) = msg.chunk_no() {
        if n > MAX_CHUNK_NO {
            return Err(BuildError::ChunkNo(n));
        }
    }
    let mut line = format!(
        "{} {} {} {} ",
        msg.kind(),
        header.version,
        header.sender_id,
        header.file_id
    );
    if let Some(n) = msg.chunk_no() {
        line.push_str(&n.to_string());
        line.push(' ');
    }
    let body: &[u8] = match msg {
        Message::PutChunk {
            replication_degree,
            body,
            ..
        } => {
            if *replication_degree == 0 || *replication_degree > MAX_REPLICATION_DEGREE {
                return Err(BuildError::ReplicationDegree(*replication_degree));
            }
            line.push_str(&replication_degree.to_string());
            line.push(' ');
            body
        }
        Message::Chunk { body, .. } => body,
        _ => &[],
    };
    if body.len() > MAX_CHUNK_SIZE {
        return Err(BuildError::BodyTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(line.len() + TERMINATOR.len() + body.len());
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(TERMINATOR);
    out.extend_from_slice(body);
    Ok(out)
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

fn field_count(kind: MessageKind) -> usize {
    match kind {
        MessageKind::PutChunk => 6,
        MessageKind::Stored
        | MessageKind::GetChunk
        | MessageKind::Chunk
        | MessageKind::Removed => 5,
        MessageKind::Delete | MessageKind::CheckDelete => 4,
    }
}

fn parse_chunk_no(s: &str) -> Result<u32, InvalidField> {
    if s.is_empty() || s.len() > 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidField::ChunkNo);
    }
    s.parse().map_err(|_| InvalidField::ChunkNo)
}

fn parse_degree(s: &str) -> Result<u8, InvalidField> {
    match s.as_bytes() {
        [d @ b'1'..=b'9'] => Ok(d - b'0'),
        _ => Err(InvalidField::ReplicationDegree),
    }
}
