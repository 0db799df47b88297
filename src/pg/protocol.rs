use bytes::{BufMut, BytesMut};

// Protocol versions are (major << 16) | minor. Only 3.0 is supported.
pub const fn pg_protocol(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

pub const PG_PROTOCOL_EARLIEST: u32 = pg_protocol(3, 0);
pub const PG_PROTOCOL_LATEST: u32 = pg_protocol(3, 0);

pub fn protocol_major(version: u32) -> u16 {
    (version >> 16) as u16
}

pub fn protocol_minor(version: u32) -> u16 {
    (version & 0xffff) as u16
}

pub fn protocol_version_supported(version: u32) -> bool {
    version >= PG_PROTOCOL_EARLIEST && version <= PG_PROTOCOL_LATEST
}

// Special request codes a client may send instead of a protocol version.
// The cancel code is deliberately outside any plausible version range.
pub const CANCEL_REQUEST_CODE: u32 = pg_protocol(1234, 5678);
pub const NEGOTIATE_SSL_CODE: u32 = pg_protocol(1234, 5679);
pub const NEGOTIATE_GSS_CODE: u32 = pg_protocol(1234, 5680);

// Startup packet length bounds. The upper bound is an arbitrary guard
// against a client declaring a huge packet up front.
pub const MIN_STARTUP_PACKET_LEN: u32 = 8;
pub const MAX_STARTUP_PACKET_LEN: u32 = 10_000;

// Upper bound on the declared length of a tagged frame. Generous for any
// realistic query text, but a hostile declaration must not make the reader
// buffer gigabytes.
pub const MAX_MESSAGE_LEN: u32 = 32 * 1024 * 1024;

// Frontend message tags.
pub const TAG_PASSWORD: u8 = b'p';
pub const TAG_QUERY: u8 = b'Q';
pub const TAG_TERMINATE: u8 = b'X';

// Backend message tags.
pub const TAG_AUTHENTICATION: u8 = b'R';
pub const TAG_PARAMETER_STATUS: u8 = b'S';
pub const TAG_READY_FOR_QUERY: u8 = b'Z';
pub const TAG_ROW_DESCRIPTION: u8 = b'T';
pub const TAG_DATA_ROW: u8 = b'D';
pub const TAG_COMMAND_COMPLETE: u8 = b'C';
pub const TAG_ERROR_RESPONSE: u8 = b'E';
pub const TAG_NOTICE_RESPONSE: u8 = b'N';

// Authentication request codes carried in 'R' messages.
pub const AUTH_REQ_OK: u32 = 0;
pub const AUTH_REQ_MD5: u32 = 5;

// SQLSTATE codes.
// See https://www.postgresql.org/docs/current/errcodes-appendix.html
pub const ERRCODE_INTERNAL_ERROR: &str = "XX000";
pub const ERRCODE_INVALID_PASSWORD: &str = "28P01";
pub const ERRCODE_PROTOCOL_VIOLATION: &str = "08P01";
pub const ERRCODE_FEATURE_NOT_SUPPORTED: &str = "0A000";
pub const ERRCODE_CONNECTION_DOES_NOT_EXIST: &str = "08003";
pub const ERRCODE_SUCCESSFUL_COMPLETION: &str = "00000";

// Transaction status reported in ReadyForQuery. Transactions are not
// supported, so sessions are always idle.
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';

/// Column types the backend can describe, with their pg catalog identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int8,
    Float8,
    Text,
    Unknown,
}

impl ColumnType {
    pub fn oid(self) -> u32 {
        match self {
            ColumnType::Bool => 16,
            ColumnType::Int8 => 20,
            ColumnType::Float8 => 701,
            ColumnType::Text => 25,
            ColumnType::Unknown => 705,
        }
    }

    /// pg_type.typlen: -1 is varlena, -2 is cstring.
    pub fn type_len(self) -> i16 {
        match self {
            ColumnType::Bool => 1,
            ColumnType::Int8 => 8,
            ColumnType::Float8 => 8,
            ColumnType::Text => -1,
            ColumnType::Unknown => -2,
        }
    }
}

/// Default atttypmod: no per-column type modifier.
pub const TYPEMOD_DEFAULT: i32 = -1;

/// All result values travel in text format.
pub const TEXT_FORMAT: u16 = 0;

const ROW_COUNT_TAGS: &[&str] = &[
    "SELECT", "DELETE", "UPDATE", "INSERT", "FETCH", "MERGE", "MOVE", "COPY",
];

/// Derive the CommandComplete tag for a query. Returns the tag and whether
/// the row count must be appended to it.
pub fn command_tag(query: &str) -> (&'static str, bool) {
    // Compared as bytes: query text is arbitrary client input and a char
    // boundary is not guaranteed at the prefix length.
    let query = query.trim_start().as_bytes();
    for tag in ROW_COUNT_TAGS {
        let matches = query
            .get(..tag.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(tag.as_bytes()));
        if matches {
            return (tag, true);
        }
    }
    ("DONE", false)
}

pub fn write_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Read a NUL-terminated byte string starting at `offset`. Returns the bytes
/// before the terminator and the offset just past it; `None` if no
/// terminator is found.
pub fn read_cstr(payload: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let rest = payload.get(offset..)?;
    let nul = rest.iter().position(|&b| b == 0)?;
    Some((&rest[..nul], offset + nul + 1))
}
