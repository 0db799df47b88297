// Wire protocol unit tests.
//
// Layouts are checked byte-for-byte against the frontend/backend protocol
// 3.0 message formats; clients are strict about these.

#[cfg(test)]
mod tests {
    use super::super::auth::{md5_password, Credentials};
    use super::super::message::*;
    use super::super::protocol::*;
    use super::super::session::{Session, SessionState};
    use crate::backend::ColumnDescription;
    use bytes::{Buf, BufMut, BytesMut};
    use std::collections::HashMap;

    fn startup_bytes(version: u32, params: &[(&str, &str)]) -> BytesMut {
        let mut payload = BytesMut::new();
        payload.put_u32(version);
        for (name, value) in params {
            write_cstr(&mut payload, name);
            write_cstr(&mut payload, value);
        }
        payload.put_u8(0);

        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32 + 4);
        buf.put_slice(&payload);
        buf
    }

    fn tagged_bytes(tag: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_u32(payload.len() as u32 + 4);
        buf.put_slice(payload);
        buf
    }

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    #[test]
    fn test_decode_startup_message() {
        let mut buf = startup_bytes(PG_PROTOCOL_LATEST, &[("user", "alice")]);
        let frame = decode_startup(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Startup {
                version: PG_PROTOCOL_LATEST,
                params: vec![("user".to_string(), "alice".to_string())],
            }
        );
        assert!(buf.is_empty(), "startup packet must be fully consumed");
    }

    #[test]
    fn test_decode_startup_preserves_parameter_order() {
        let mut buf = startup_bytes(
            PG_PROTOCOL_LATEST,
            &[("user", "bob"), ("database", "db"), ("options", "-c x=1")],
        );
        let frame = decode_startup(&mut buf).unwrap().unwrap();
        match frame {
            Frame::Startup { params, .. } => {
                let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["user", "database", "options"]);
            }
            other => panic!("expected startup frame, got {:?}", other),
        }
    }

    #[test]
    fn test_startup_resumable_at_every_split() {
        let full = startup_bytes(PG_PROTOCOL_LATEST, &[("user", "alice")]);
        for split in 0..full.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&full[..split]);
            let before = buf.len();
            assert!(
                matches!(decode_startup(&mut buf), Ok(None)),
                "split at {} must need more data",
                split
            );
            assert_eq!(buf.len(), before, "NeedMoreData must not consume input");

            buf.extend_from_slice(&full[split..]);
            let frame = decode_startup(&mut buf).unwrap().unwrap();
            assert!(matches!(frame, Frame::Startup { .. }));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_frame_resumable_at_every_split() {
        let full = tagged_bytes(TAG_QUERY, &cstr("SELECT 1"));
        for split in 0..full.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&full[..split]);
            let outcome = decode_frame(&mut buf);
            // The tag byte alone is enough to reject an unknown kind, but a
            // known tag must wait for the whole frame.
            assert!(matches!(outcome, Ok(None)), "split at {}", split);

            buf.extend_from_slice(&full[split..]);
            let frame = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(frame, Frame::Query { sql: "SELECT 1".to_string() });
        }
    }

    #[test]
    fn test_decode_frame_sequence() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&tagged_bytes(TAG_QUERY, &cstr("SELECT 1")));
        buf.extend_from_slice(&tagged_bytes(TAG_TERMINATE, &[]));

        assert_eq!(
            decode_frame(&mut buf).unwrap().unwrap(),
            Frame::Query { sql: "SELECT 1".to_string() }
        );
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), Frame::Terminate);
        assert!(matches!(decode_frame(&mut buf), Ok(None)));
    }

    #[test]
    fn test_decode_password_message() {
        let mut buf = tagged_bytes(TAG_PASSWORD, &cstr("md5abc123"));
        assert_eq!(
            decode_frame(&mut buf).unwrap().unwrap(),
            Frame::Password { data: "md5abc123".to_string() }
        );
    }

    #[test]
    fn test_startup_length_out_of_bounds() {
        // Declared length below the minimum.
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        assert_eq!(
            decode_startup(&mut buf),
            Err(FrameError::InvalidStartupLength(4))
        );

        // Declared length above the DoS guard.
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_STARTUP_PACKET_LEN + 1);
        assert!(matches!(
            decode_startup(&mut buf),
            Err(FrameError::InvalidStartupLength(_))
        ));
    }

    #[test]
    fn test_startup_truncated_parameters() {
        // Length and version are fine but the parameter area is not
        // NUL-terminated.
        let mut payload = BytesMut::new();
        payload.put_u32(PG_PROTOCOL_LATEST);
        payload.put_slice(b"user"); // no terminator, no value

        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32 + 4);
        buf.put_slice(&payload);

        assert!(matches!(
            decode_startup(&mut buf),
            Err(FrameError::Truncated(_))
        ));
    }

    #[test]
    fn test_decode_ssl_and_gss_requests() {
        // Request codes carry no parameters; the packet is exactly 8 bytes.
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_u32(NEGOTIATE_SSL_CODE);
        assert_eq!(decode_startup(&mut buf).unwrap().unwrap(), Frame::SslRequest);

        buf.put_u32(8);
        buf.put_u32(NEGOTIATE_GSS_CODE);
        assert_eq!(
            decode_startup(&mut buf).unwrap().unwrap(),
            Frame::GssEncRequest
        );
    }

    #[test]
    fn test_decode_cancel_request() {
        let mut buf = BytesMut::new();
        buf.put_u32(16);
        buf.put_u32(CANCEL_REQUEST_CODE);
        buf.put_u32(42);
        buf.put_u32(0xdeadbeef);
        assert_eq!(
            decode_startup(&mut buf).unwrap().unwrap(),
            Frame::CancelRequest { backend_pid: 42, secret: 0xdeadbeef }
        );

        // Cancel requests have a fixed size.
        let mut buf = BytesMut::new();
        buf.put_u32(12);
        buf.put_u32(CANCEL_REQUEST_CODE);
        buf.put_u32(42);
        assert_eq!(
            decode_startup(&mut buf),
            Err(FrameError::InvalidCancelLength(12))
        );
    }

    #[test]
    fn test_unknown_tag_is_rejected_immediately() {
        let mut buf = tagged_bytes(b'F', &[1, 2, 3]);
        assert_eq!(decode_frame(&mut buf), Err(FrameError::UnknownTag(b'F')));
    }

    #[test]
    fn test_invalid_frame_length() {
        // A length field smaller than its own size can never be valid.
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_QUERY);
        buf.put_u32(3);
        assert_eq!(decode_frame(&mut buf), Err(FrameError::InvalidLength(3)));
    }

    #[test]
    fn test_oversized_frame_length_is_rejected() {
        // A hostile declared length is rejected up front, before any
        // attempt to buffer that much input.
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_QUERY);
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert_eq!(
            decode_frame(&mut buf),
            Err(FrameError::InvalidLength(MAX_MESSAGE_LEN + 1))
        );
    }

    #[test]
    fn test_invalid_utf8_is_bad_encoding() {
        let mut buf = tagged_bytes(TAG_QUERY, &[0xff, 0xfe, 0x00]);
        assert_eq!(
            decode_frame(&mut buf),
            Err(FrameError::BadEncoding("query message"))
        );

        let mut payload = BytesMut::new();
        payload.put_u32(PG_PROTOCOL_LATEST);
        payload.put_slice(b"user\0\xff\xff\0");
        payload.put_u8(0);
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32 + 4);
        buf.put_slice(&payload);
        assert_eq!(
            decode_startup(&mut buf),
            Err(FrameError::BadEncoding("startup message parameter value"))
        );
    }

    #[test]
    fn test_ready_for_query_layout() {
        let bytes = ReadyForQuery.encode();
        assert_eq!(&bytes[..], &[b'Z', 0, 0, 0, 5, b'I']);
    }

    #[test]
    fn test_authentication_layouts() {
        let ok = AuthenticationRequest::Ok.encode();
        assert_eq!(&ok[..], &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);

        let md5 = AuthenticationRequest::Md5Password { salt: [1, 2, 3, 4] }.encode();
        assert_eq!(&md5[..], &[b'R', 0, 0, 0, 12, 0, 0, 0, 5, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parameter_status_layout() {
        let bytes = ParameterStatus { name: "client_encoding", value: "UTF8" }.encode();
        assert_eq!(bytes[0], b'S');
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(len as usize, bytes.len() - 1);
        assert_eq!(&bytes[5..], b"client_encoding\0UTF8\0");
    }

    #[test]
    fn test_error_response_fields() {
        let bytes = ErrorResponse::new(ERRCODE_PROTOCOL_VIOLATION, "boom").encode();
        assert_eq!(bytes[0], b'E');
        let mut expected = Vec::new();
        expected.push(b'S');
        expected.extend_from_slice(&cstr("ERROR"));
        expected.push(b'C');
        expected.extend_from_slice(&cstr("08P01"));
        expected.push(b'M');
        expected.extend_from_slice(&cstr("boom"));
        expected.push(0);
        assert_eq!(&bytes[5..], &expected[..]);
    }

    #[test]
    fn test_notice_response_severity() {
        let bytes = NoticeResponse::new("shutting down").encode();
        assert_eq!(bytes[0], b'N');
        assert_eq!(&bytes[5..12], b"SNOTICE");
    }

    #[test]
    fn test_row_description_layout() {
        let columns = vec![
            ColumnDescription::new("id", ColumnType::Int8),
            ColumnDescription::new("name", ColumnType::Text),
        ];
        let bytes = RowDescription { columns: &columns }.encode();
        let mut buf = BytesMut::from(&bytes[..]);

        assert_eq!(buf.get_u8(), b'T');
        let _len = buf.get_u32();
        assert_eq!(buf.get_u16(), 2);

        // First column: int8.
        assert_eq!(&buf.split_to(3)[..], b"id\0");
        assert_eq!(buf.get_u32(), 0); // table oid
        assert_eq!(buf.get_u16(), 0); // column attr
        assert_eq!(buf.get_u32(), 20); // int8 oid
        assert_eq!(buf.get_i16(), 8);
        assert_eq!(buf.get_i32(), -1); // typemod
        assert_eq!(buf.get_u16(), TEXT_FORMAT);

        // Second column: text is varlena.
        assert_eq!(&buf.split_to(5)[..], b"name\0");
        buf.advance(6);
        assert_eq!(buf.get_u32(), 25); // text oid
        assert_eq!(buf.get_i16(), -1);
    }

    #[test]
    fn test_data_row_layout_with_null() {
        let values = vec![Some("42".to_string()), None];
        let bytes = DataRow { values: &values }.encode();
        let mut buf = BytesMut::from(&bytes[..]);

        assert_eq!(buf.get_u8(), b'D');
        let _len = buf.get_u32();
        assert_eq!(buf.get_u16(), 2);
        assert_eq!(buf.get_i32(), 2);
        assert_eq!(&buf.split_to(2)[..], b"42");
        assert_eq!(buf.get_i32(), -1); // NULL
        assert!(buf.is_empty());
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(command_tag("SELECT * FROM t"), ("SELECT", true));
        assert_eq!(command_tag("  select 1"), ("SELECT", true));
        assert_eq!(command_tag("delete from t"), ("DELETE", true));
        assert_eq!(command_tag("CREATE TABLE t (a int)"), ("DONE", false));
        assert_eq!(command_tag(""), ("DONE", false));
        // Multibyte query text must not trip the prefix comparison.
        assert_eq!(command_tag("set €ab"), ("DONE", false));
        assert_eq!(command_tag("s€"), ("DONE", false));
    }

    #[test]
    fn test_command_complete_tags() {
        assert_eq!(CommandComplete::for_query("SELECT 1", 3).tag, "SELECT 3");
        // Inserts are special: the legacy oid column is always zero.
        assert_eq!(
            CommandComplete::for_query("insert into t values (1)", 1).tag,
            "INSERT 0 1"
        );
        assert_eq!(CommandComplete::for_query("VACUUM", 0).tag, "DONE");
    }

    #[test]
    fn test_md5_exchange_verification() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let credentials = Credentials::new(users);

        let salt = [0x01, 0x02, 0x03, 0x04];
        let response = md5_password("alice", "secret", &salt);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);

        assert!(credentials.verify_md5("alice", &salt, &response));
        assert!(!credentials.verify_md5("alice", &[9, 9, 9, 9], &response));
        assert!(!credentials.verify_md5(
            "alice",
            &salt,
            &md5_password("alice", "wrong", &salt)
        ));
        assert!(!credentials.verify_md5("mallory", &salt, &response));
    }

    #[test]
    fn test_session_transitions_forward_only() {
        let mut session = Session::new(7, 3);
        assert_eq!(session.state(), SessionState::AwaitingStartup);

        session.set_user("alice".to_string());
        session.advance(SessionState::Authenticating);
        session.advance(SessionState::Ready);
        session.advance(SessionState::Executing);
        session.advance(SessionState::Ready);
        session.advance(SessionState::Terminated);
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_session_error_absorbing() {
        let mut session = Session::new(8, 3);
        session.advance(SessionState::ErrorTerminated);
        assert!(session.state().is_terminal());

        // A failed write and the caller's own error handling both report
        // failure; the second report must be a no-op, not a bug.
        session.advance(SessionState::ErrorTerminated);
        assert_eq!(session.state(), SessionState::ErrorTerminated);

        // A cleanly terminated session stays cleanly terminated.
        let mut session = Session::new(9, 3);
        session.advance(SessionState::Authenticating);
        session.advance(SessionState::Ready);
        session.advance(SessionState::Terminated);
        session.advance(SessionState::ErrorTerminated);
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn test_auth_attempt_bound() {
        let mut session = Session::new(9, 3);
        assert!(session.record_auth_failure());
        assert!(session.record_auth_failure());
        // Third failure exhausts the bound.
        assert!(!session.record_auth_failure());
        assert_eq!(session.auth_attempts(), 3);
    }
}
