//! Wire-format frames: decoding of frontend messages and encoding of
//! backend messages. Pure byte manipulation, no I/O, no shared state.
//!
//! Decoding is resumable: a short buffer yields `Ok(None)` without consuming
//! input so the caller can append the next read and retry. A malformed frame
//! yields an error and the owning session must close the connection; there is
//! no resync.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::protocol::*;
use crate::backend::ColumnDescription;

/// A decoded frontend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Startup {
        version: u32,
        /// Parameter name/value pairs in arrival order.
        params: Vec<(String, String)>,
    },
    SslRequest,
    GssEncRequest,
    CancelRequest {
        backend_pid: u32,
        secret: u32,
    },
    Password {
        data: String,
    },
    Query {
        sql: String,
    },
    Terminate,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("'{}' message type is not supported", char::from(*.0))]
    UnknownTag(u8),

    #[error("invalid message length: {0}")]
    InvalidLength(u32),

    #[error("invalid startup message length: {0}")]
    InvalidStartupLength(u32),

    #[error("invalid length of cancel request: {0}")]
    InvalidCancelLength(u32),

    #[error("incomplete message: {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    BadEncoding(&'static str),
}

pub type DecodeResult = Result<Option<Frame>, FrameError>;

/// Read a NUL-terminated string and require valid UTF-8.
fn cstr_utf8(
    payload: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<(String, usize), FrameError> {
    let (bytes, next) = read_cstr(payload, offset).ok_or(FrameError::Truncated(what))?;
    let s = std::str::from_utf8(bytes).map_err(|_| FrameError::BadEncoding(what))?;
    Ok((s.to_string(), next))
}

/// Decode the startup-phase message. It has no tag byte: just a length
/// (which includes itself) and a protocol version or request code.
pub fn decode_startup(buf: &mut BytesMut) -> DecodeResult {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < MIN_STARTUP_PACKET_LEN || len > MAX_STARTUP_PACKET_LEN {
        return Err(FrameError::InvalidStartupLength(len));
    }
    if buf.len() < len as usize {
        return Ok(None);
    }

    let mut packet = buf.split_to(len as usize);
    packet.advance(4);
    let version = packet.get_u32();

    match version {
        NEGOTIATE_SSL_CODE => Ok(Some(Frame::SslRequest)),
        NEGOTIATE_GSS_CODE => Ok(Some(Frame::GssEncRequest)),
        CANCEL_REQUEST_CODE => {
            // Fixed layout: len + code + pid + secret.
            if len != 16 {
                return Err(FrameError::InvalidCancelLength(len));
            }
            let backend_pid = packet.get_u32();
            let secret = packet.get_u32();
            Ok(Some(Frame::CancelRequest { backend_pid, secret }))
        }
        _ => {
            let params = parse_startup_params(&packet)?;
            Ok(Some(Frame::Startup { version, params }))
        }
    }
}

fn parse_startup_params(payload: &[u8]) -> Result<Vec<(String, String)>, FrameError> {
    let mut params = Vec::new();
    let mut offset = 0;
    loop {
        let (name, next) = cstr_utf8(payload, offset, "startup message parameters")?;
        if name.is_empty() {
            return Ok(params);
        }
        let (value, next) = cstr_utf8(payload, next, "startup message parameter value")?;
        params.push((name, value));
        offset = next;
    }
}

/// Decode a regular tagged frontend message:
/// `tag(u8) + len(u32, includes itself, excludes tag) + payload`.
pub fn decode_frame(buf: &mut BytesMut) -> DecodeResult {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    if tag != TAG_PASSWORD && tag != TAG_QUERY && tag != TAG_TERMINATE {
        return Err(FrameError::UnknownTag(tag));
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len > MAX_MESSAGE_LEN {
        return Err(FrameError::InvalidLength(len));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut packet = buf.split_to(total);
    packet.advance(5);
    let payload = packet.freeze();

    match tag {
        TAG_PASSWORD => {
            let (data, _) = cstr_utf8(&payload, 0, "password message")?;
            Ok(Some(Frame::Password { data }))
        }
        TAG_QUERY => {
            let (sql, _) = cstr_utf8(&payload, 0, "query message")?;
            Ok(Some(Frame::Query { sql }))
        }
        TAG_TERMINATE => Ok(Some(Frame::Terminate)),
        _ => unreachable!("tag checked above"),
    }
}

/// Frame a backend message payload with its tag and length.
fn frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(tag);
    buf.put_u32(payload.len() as u32 + 4);
    buf.put_slice(payload);
    buf.freeze()
}

/// Authentication request ('R') sent by the backend.
pub enum AuthenticationRequest {
    Ok,
    Md5Password { salt: [u8; 4] },
}

impl AuthenticationRequest {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            AuthenticationRequest::Ok => payload.put_u32(AUTH_REQ_OK),
            AuthenticationRequest::Md5Password { salt } => {
                payload.put_u32(AUTH_REQ_MD5);
                payload.put_slice(salt);
            }
        }
        frame(TAG_AUTHENTICATION, &payload)
    }
}

/// ParameterStatus ('S'): reports a run-time parameter to the client.
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl ParameterStatus<'_> {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        write_cstr(&mut payload, self.name);
        write_cstr(&mut payload, self.value);
        frame(TAG_PARAMETER_STATUS, &payload)
    }
}

/// ReadyForQuery ('Z'): the client may safely send a new command.
/// Transaction blocks are not supported, so the status is always idle.
pub struct ReadyForQuery;

impl ReadyForQuery {
    pub fn encode(&self) -> Bytes {
        frame(TAG_READY_FOR_QUERY, &[TRANSACTION_STATUS_IDLE])
    }
}

/// RowDescription ('T'): the shape of the DataRow messages that follow.
pub struct RowDescription<'a> {
    pub columns: &'a [ColumnDescription],
}

impl RowDescription<'_> {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u16(self.columns.len() as u16);
        for col in self.columns {
            write_cstr(&mut payload, &col.name);
            // Table oid and column attribute number are zero: results are
            // never simple base-table column references here.
            payload.put_u32(0);
            payload.put_u16(0);
            payload.put_u32(col.ty.oid());
            payload.put_i16(col.ty.type_len());
            payload.put_i32(TYPEMOD_DEFAULT);
            payload.put_u16(TEXT_FORMAT);
        }
        frame(TAG_ROW_DESCRIPTION, &payload)
    }
}

/// DataRow ('D'): one result row in text format; `None` encodes SQL NULL.
pub struct DataRow<'a> {
    pub values: &'a [Option<String>],
}

impl DataRow<'_> {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u16(self.values.len() as u16);
        for value in self.values {
            match value {
                Some(v) => {
                    payload.put_i32(v.len() as i32);
                    payload.put_slice(v.as_bytes());
                }
                None => payload.put_i32(-1),
            }
        }
        frame(TAG_DATA_ROW, &payload)
    }
}

/// CommandComplete ('C'): the query finished successfully.
pub struct CommandComplete {
    pub tag: String,
}

impl CommandComplete {
    /// Build the completion tag for a query. Row counts are only reported
    /// for the statement kinds that postgres reports them for, and INSERT
    /// additionally carries the legacy oid column.
    pub fn for_query(query: &str, row_count: u64) -> Self {
        let (tag, display_row_count) = command_tag(query);
        let tag = if !display_row_count {
            tag.to_string()
        } else if tag == "INSERT" {
            format!("{tag} 0 {row_count}")
        } else {
            format!("{tag} {row_count}")
        };
        Self { tag }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        write_cstr(&mut payload, &self.tag);
        frame(TAG_COMMAND_COMPLETE, &payload)
    }
}

// Error and notice field identifiers.
// See https://www.postgresql.org/docs/current/protocol-error-fields.html
const FIELD_SEVERITY: u8 = b'S';
const FIELD_SQLSTATE: u8 = b'C';
const FIELD_MESSAGE: u8 = b'M';

fn encode_report(tag: u8, severity: &str, sqlstate: &str, message: &str) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_u8(FIELD_SEVERITY);
    write_cstr(&mut payload, severity);
    payload.put_u8(FIELD_SQLSTATE);
    write_cstr(&mut payload, sqlstate);
    payload.put_u8(FIELD_MESSAGE);
    write_cstr(&mut payload, message);
    payload.put_u8(0);
    frame(tag, &payload)
}

/// ErrorResponse ('E').
pub struct ErrorResponse {
    pub sqlstate: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            sqlstate: sqlstate.to_string(),
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_report(TAG_ERROR_RESPONSE, "ERROR", &self.sqlstate, &self.message)
    }
}

/// NoticeResponse ('N'): informational, does not affect the session.
pub struct NoticeResponse {
    pub message: String,
}

impl NoticeResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn encode(&self) -> Bytes {
        encode_report(
            TAG_NOTICE_RESPONSE,
            "NOTICE",
            ERRCODE_SUCCESSFUL_COMPLETION,
            &self.message,
        )
    }
}
