//! Session runner: owns one client socket and drives the protocol state
//! machine to a terminal state. All socket I/O for the session happens here;
//! the runner suspends only at read/write boundaries and observes its cancel
//! flag at every read suspension point.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::auth::{self, Credentials};
use super::message::{
    decode_frame, decode_startup, AuthenticationRequest, CommandComplete, DataRow,
    ErrorResponse, Frame, FrameError, NoticeResponse, ParameterStatus, ReadyForQuery,
    RowDescription,
};
use super::protocol::*;
use super::session::{Session, SessionState};
use crate::backend::{Backend, QueryOutcome};
use crate::error::{PgFeError, Result};

const READ_CHUNK: usize = 8192;

/// Settings shared by every session of one server instance.
pub struct SessionSettings {
    pub max_auth_attempts: u32,
    pub server_version: String,
    pub credentials: Credentials,
}

/// What a blocking read produced.
enum Input {
    Frame(Frame),
    Eof,
    Cancelled,
}

/// Outcome of a phase that may be interrupted by server stop.
enum Flow {
    Continue,
    Cancelled,
}

pub struct SessionRunner {
    stream: TcpStream,
    read_buf: BytesMut,
    out_buf: BytesMut,
    session: Session,
    settings: Arc<SessionSettings>,
    backend: Arc<dyn Backend>,
    cancel: watch::Receiver<bool>,
}

impl SessionRunner {
    pub fn new(
        stream: TcpStream,
        id: u32,
        settings: Arc<SessionSettings>,
        backend: Arc<dyn Backend>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let session = Session::new(id, settings.max_auth_attempts);
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            out_buf: BytesMut::new(),
            session,
            settings,
            backend,
            cancel,
        }
    }

    /// Drive the session to a terminal state. The socket is owned by `self`
    /// and released exactly once, when the runner is dropped on return.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        debug_assert!(self.session.state().is_terminal());
        result
    }

    async fn serve(&mut self) -> Result<()> {
        // ---- startup ----
        let frame = match self.next_input(true).await? {
            Input::Cancelled => return self.cancelled().await,
            Input::Eof => {
                // Client connected and left without sending anything; port
                // scanners and health checks do this all the time.
                self.session.advance(SessionState::ErrorTerminated);
                return Ok(());
            }
            Input::Frame(frame) => frame,
        };

        match frame {
            Frame::Startup { version, params } => {
                self.process_startup(version, params).await?;
            }
            Frame::SslRequest => {
                return Err(self
                    .fail(ERRCODE_FEATURE_NOT_SUPPORTED, "SSL is not supported".into())
                    .await);
            }
            Frame::GssEncRequest => {
                return Err(self
                    .fail(
                        ERRCODE_FEATURE_NOT_SUPPORTED,
                        "GSSAPI encryption is not supported".into(),
                    )
                    .await);
            }
            Frame::CancelRequest { .. } => {
                // Nothing to cancel; drop the connection without a response.
                self.session.advance(SessionState::ErrorTerminated);
                return Ok(());
            }
            other => {
                return Err(self
                    .fail(
                        ERRCODE_PROTOCOL_VIOLATION,
                        format!("unexpected '{}' message before startup", frame_tag(&other)),
                    )
                    .await);
            }
        }

        // ---- authentication ----
        if let Flow::Cancelled = self.authenticate().await? {
            return self.cancelled().await;
        }

        self.queue(
            ParameterStatus { name: "client_encoding", value: "UTF8" }.encode(),
        );
        let server_version = self.settings.server_version.clone();
        self.queue(
            ParameterStatus { name: "server_version", value: &server_version }.encode(),
        );

        // ---- query cycle ----
        loop {
            self.send(ReadyForQuery.encode()).await?;

            match self.next_input(false).await? {
                Input::Cancelled => return self.cancelled().await,
                Input::Eof => {
                    self.session.advance(SessionState::ErrorTerminated);
                    return Err(PgFeError::ConnectionClosed);
                }
                Input::Frame(Frame::Query { sql }) => {
                    self.session.advance(SessionState::Executing);
                    self.execute(&sql).await?;
                }
                Input::Frame(Frame::Terminate) => {
                    debug!("session {}: got Terminate message", self.session.id());
                    self.session.advance(SessionState::Terminated);
                    return Ok(());
                }
                Input::Frame(other) => {
                    return Err(self
                        .fail(
                            ERRCODE_FEATURE_NOT_SUPPORTED,
                            format!(
                                "'{}' message type is not supported",
                                frame_tag(&other)
                            ),
                        )
                        .await);
                }
            }
        }
    }

    async fn process_startup(
        &mut self,
        version: u32,
        params: Vec<(String, String)>,
    ) -> Result<()> {
        if !protocol_version_supported(version) {
            let msg = format!(
                "unsupported frontend protocol {}.{}: server supports {}.{} to {}.{}",
                protocol_major(version),
                protocol_minor(version),
                protocol_major(PG_PROTOCOL_EARLIEST),
                protocol_minor(PG_PROTOCOL_EARLIEST),
                protocol_major(PG_PROTOCOL_LATEST),
                protocol_minor(PG_PROTOCOL_LATEST),
            );
            return Err(self.fail(ERRCODE_FEATURE_NOT_SUPPORTED, msg).await);
        }

        let mut user = None;
        for (name, value) in params {
            if name == "user" {
                user = Some(value);
            } else {
                // Logged but not fatal; the client still gets its session.
                warn!(
                    "session {}: startup parameter {}={} is not supported",
                    self.session.id(),
                    name,
                    value
                );
            }
        }

        match user {
            Some(user) if !user.is_empty() => {
                debug!(
                    "session {}: processed startup message for user '{}'",
                    self.session.id(),
                    user
                );
                self.session.set_user(user);
                self.session.advance(SessionState::Authenticating);
                Ok(())
            }
            _ => Err(self
                .fail(
                    ERRCODE_PROTOCOL_VIOLATION,
                    "incomplete startup message: no user".into(),
                )
                .await),
        }
    }

    async fn authenticate(&mut self) -> Result<Flow> {
        let user = self
            .session
            .user()
            .expect("startup message sets the user")
            .to_string();

        loop {
            let salt = auth::generate_salt();
            self.send(AuthenticationRequest::Md5Password { salt }.encode()).await?;

            let frame = match self.next_input(false).await? {
                Input::Cancelled => return Ok(Flow::Cancelled),
                Input::Eof => {
                    // Disconnecting instead of offering a password is legal
                    // per protocol spec and commonly done by psql.
                    self.session.advance(SessionState::ErrorTerminated);
                    return Err(PgFeError::ConnectionClosed);
                }
                Input::Frame(frame) => frame,
            };

            let data = match frame {
                Frame::Password { data } => data,
                other => {
                    return Err(self
                        .fail(
                            ERRCODE_PROTOCOL_VIOLATION,
                            format!(
                                "expected password response, got '{}' message type",
                                frame_tag(&other)
                            ),
                        )
                        .await);
                }
            };

            if self.settings.credentials.verify_md5(&user, &salt, &data) {
                // AuthenticationOk is flushed together with the parameter
                // status messages and the first ReadyForQuery.
                self.queue(AuthenticationRequest::Ok.encode());
                self.session.advance(SessionState::Ready);
                info!("session {}: authenticated user '{}'", self.session.id(), user);
                return Ok(Flow::Continue);
            }

            let failure = format!("md5 authentication failed for user '{}'", user);
            warn!(
                "session {}: {} (attempt {})",
                self.session.id(),
                failure,
                self.session.auth_attempts() + 1
            );
            if !self.session.record_auth_failure() {
                let _ = self
                    .send(ErrorResponse::new(ERRCODE_INVALID_PASSWORD, &*failure).encode())
                    .await;
                self.session.advance(SessionState::ErrorTerminated);
                return Err(PgFeError::AuthFailed(user));
            }
            // Report the failure and offer another exchange.
            self.send(ErrorResponse::new(ERRCODE_INVALID_PASSWORD, failure).encode())
                .await?;
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!("session {}: processing query '{}'", self.session.id(), sql.trim());

        match self.backend.dispatch(sql) {
            Ok(QueryOutcome::Rows { columns, rows }) => {
                self.queue(RowDescription { columns: &columns }.encode());
                let row_count = rows.len() as u64;
                for row in &rows {
                    self.queue(DataRow { values: row }.encode());
                }
                self.queue(CommandComplete::for_query(sql, row_count).encode());
                self.flush().await?;
                self.session.advance(SessionState::Ready);
                Ok(())
            }
            Ok(QueryOutcome::RowCount(count)) => {
                self.send(CommandComplete::for_query(sql, count).encode()).await?;
                self.session.advance(SessionState::Ready);
                Ok(())
            }
            Err(e) if !e.fatal => {
                warn!(
                    "session {}: query failed: {}",
                    self.session.id(),
                    e.message
                );
                self.send(ErrorResponse::new(&e.sqlstate, &*e.message).encode()).await?;
                self.session.advance(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .send(ErrorResponse::new(&e.sqlstate, &*e.message).encode())
                    .await;
                self.session.advance(SessionState::ErrorTerminated);
                Err(PgFeError::Backend(e.message))
            }
        }
    }

    /// Read until a full frame is decoded, EOF is seen, or the session is
    /// cancelled. `Ok(None)` from the codec means more bytes are needed;
    /// decode errors are reported to the client and end the session.
    async fn next_input(&mut self, startup: bool) -> Result<Input> {
        loop {
            let decoded = if startup {
                decode_startup(&mut self.read_buf)
            } else {
                decode_frame(&mut self.read_buf)
            };
            match decoded {
                Ok(Some(frame)) => return Ok(Input::Frame(frame)),
                Ok(None) => {}
                Err(e) => {
                    let sqlstate = match e {
                        FrameError::UnknownTag(_) => ERRCODE_FEATURE_NOT_SUPPORTED,
                        _ => ERRCODE_PROTOCOL_VIOLATION,
                    };
                    return Err(self.fail(sqlstate, e.to_string()).await);
                }
            }

            tokio::select! {
                changed = self.cancel.changed() => {
                    // A dropped sender counts as cancellation too.
                    let _ = changed;
                    return Ok(Input::Cancelled);
                }
                res = self.stream.read_buf(&mut self.read_buf) => {
                    match res {
                        Ok(0) => return Ok(Input::Eof),
                        Ok(_) => {}
                        Err(e) => {
                            // The peer is gone; nothing can be sent back.
                            self.session.advance(SessionState::ErrorTerminated);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Send an ErrorResponse (best effort), mark the session failed and
    /// hand back the error the caller should propagate.
    async fn fail(&mut self, sqlstate: &str, message: String) -> PgFeError {
        let _ = self.send(ErrorResponse::new(sqlstate, &*message).encode()).await;
        self.session.advance(SessionState::ErrorTerminated);
        PgFeError::Protocol(message)
    }

    /// Server stop interrupted the session: tell the client why, best effort.
    async fn cancelled(&mut self) -> Result<()> {
        info!(
            "session {}: closed because the server is stopping",
            self.session.id()
        );
        let _ = self
            .send(
                NoticeResponse::new("server is stopping and closing all connections")
                    .encode(),
            )
            .await;
        self.session.advance(SessionState::ErrorTerminated);
        Ok(())
    }

    fn queue(&mut self, msg: Bytes) {
        self.out_buf.extend_from_slice(&msg);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        let buf = self.out_buf.split();
        let result = async {
            self.stream.write_all(&buf).await?;
            self.stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.session.advance(SessionState::ErrorTerminated);
            return Err(e.into());
        }
        Ok(())
    }

    async fn send(&mut self, msg: Bytes) -> Result<()> {
        self.queue(msg);
        self.flush().await
    }
}

fn frame_tag(frame: &Frame) -> char {
    match frame {
        Frame::Password { .. } => 'p',
        Frame::Query { .. } => 'Q',
        Frame::Terminate => 'X',
        // Untagged startup-phase messages; only reachable on protocol abuse.
        Frame::Startup { .. } | Frame::SslRequest | Frame::GssEncRequest
        | Frame::CancelRequest { .. } => '?',
    }
}
