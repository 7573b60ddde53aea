//! Postgres connection: resource ownership and the pipelined phase machine.
mod config;

pub use config::{Config, ParseError};

use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
    time::Instant,
};

use bytes::BytesMut;
use lru::LruCache;
use tokio::io::AsyncWriteExt;

use crate::{
    ErrorKind, Result,
    common::ByteStr,
    logger::LogLevel,
    net::Socket,
    postgres::{
        BackendMessage, BackendProtocol,
        backend::{self, NotificationResponse},
        frontend,
    },
    rmsgs::RMsgs,
    statement::PreparedStatement,
    stream::Frontend,
    types::TypeRegistry,
};

const DEFAULT_PREPARED_STMT_CACHE: NonZeroUsize = NonZeroUsize::new(24).unwrap();

/// Postgres Connection.
///
/// A connection runs at most one query at a time; the rows cursor holds an
/// exclusive borrow for its whole lifetime and the `lock`/`unlock` pair
/// additionally rejects re-entrant queries left behind by an unclosed
/// cursor.
///
/// Prepared statements are cached transparently, keyed by the hash of
/// their SQL text. Evicted statements are closed server-side.
#[derive(Debug)]
pub struct Connection {
    pub(crate) frontend: Frontend,
    pub(crate) rmsgs: RMsgs,
    pub(crate) registry: Arc<TypeRegistry>,

    stmts: LruCache<u64, Arc<PreparedStatement>>,
    pub(crate) run_params: HashMap<ByteStr, ByteStr>,
    notifications: VecDeque<NotificationResponse>,

    host: ByteStr,
    port: u16,
    backend_key: Option<backend::BackendKeyData>,

    // phase state
    pub(crate) pending_ready: usize,
    locked: bool,
    dead: bool,

    pub(crate) last_activity: Instant,
    pub(crate) log_level: LogLevel,
}

impl Connection {
    /// Perform a startup via url.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(&Config::parse(url)?).await
    }

    /// Perform a startup with parsed options.
    pub async fn connect_with(config: &Config) -> Result<Self> {
        let socket = match config.host.as_ref() {
            "localhost" => {
                Socket::connect_socket(&format!("/run/postgresql/.s.PGSQL.{}", config.port)).await?
            }
            host => Socket::connect_tcp(host, config.port).await?,
        };

        let mut me = Self::from_socket(socket, config.host.clone(), config.port);
        me.startup(config)
            .await
            .map_err(|err| err.with_context("postgres startup"))?;
        Ok(me)
    }

    fn from_socket(socket: Socket, host: ByteStr, port: u16) -> Self {
        Self {
            frontend: Frontend::new(socket),
            rmsgs: RMsgs::new(),
            registry: Arc::new(TypeRegistry::with_defaults()),
            stmts: LruCache::new(DEFAULT_PREPARED_STMT_CACHE),
            run_params: HashMap::new(),
            notifications: VecDeque::new(),
            host,
            port,
            backend_key: None,
            pending_ready: 0,
            locked: false,
            dead: false,
            last_activity: Instant::now(),
            log_level: LogLevel::Unset,
        }
    }

    /// Connection over an in-memory pipe, startup skipped.
    #[cfg(test)]
    pub(crate) fn pipe(stream: tokio::io::DuplexStream) -> Self {
        let mut me = Self::from_socket(Socket::pipe(stream), ByteStr::from_static("pipe"), 0);
        me.run_params
            .insert("standard_conforming_strings".into(), "on".into());
        me.run_params.insert("client_encoding".into(), "UTF8".into());
        me
    }

    /// Perform the startup phase.
    ///
    /// <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
    async fn startup(&mut self, config: &Config) -> Result<()> {
        self.frontend.send_startup(frontend::Startup {
            user: &config.user,
            database: Some(&config.dbname).filter(|db| !db.is_empty()).map(|db| db.as_ref()),
            replication: None,
        });
        self.frontend.flush().await?;

        // The server then sends an appropriate authentication request
        // message, to which the frontend must reply.
        loop {
            use backend::Authentication::*;
            match self.recv_message(None).await? {
                BackendMessage::Authentication(auth) => match auth {
                    Ok => break,
                    CleartextPassword => {
                        self.frontend
                            .send(frontend::PasswordMessage { password: &config.password });
                        self.frontend.flush().await?;
                    }
                    _ => return Err(ErrorKind::UnsupportedAuth.into()),
                },
                BackendMessage::ErrorResponse(err) => return Err(err.error.into()),
                f => {
                    return Err(crate::postgres::ProtocolError::unexpected_phase(
                        f.msgtype(),
                        "authentication",
                    )
                    .into());
                }
            }
        }

        // In this phase a backend process is being started, and the
        // frontend is just an interested bystander. The backend will send
        // ParameterStatus messages, BackendKeyData, and finally
        // ReadyForQuery.
        loop {
            match self.recv_message(None).await? {
                BackendMessage::ReadyForQuery(_) => break,
                BackendMessage::BackendKeyData(key) => self.backend_key = Some(key),
                BackendMessage::ParameterStatus(param) => {
                    self.run_params.insert(param.name, param.value);
                }
                BackendMessage::NoticeResponse(warn) => {
                    tracing::warn!(target: "postrow", "{}", warn.notice);
                }
                BackendMessage::ErrorResponse(err) => return Err(err.error.into()),
                f => {
                    return Err(crate::postgres::ProtocolError::unexpected_phase(
                        f.msgtype(),
                        "startup phase",
                    )
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Gracefully close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.frontend.send(frontend::Terminate);
        self.frontend.flush().await?;
        self.frontend.shutdown().await?;
        Ok(())
    }

    /// Token for canceling the in-flight query from another task.
    ///
    /// The cancel request travels on a second connection; whether it has
    /// any effect is up to the server.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|key| CancelToken {
            host: self.host.clone(),
            port: self.port,
            process_id: key.process_id,
            secret_key: key.secret_key,
        })
    }

    /// A runtime parameter reported by the server.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.run_params.get(name).map(|v| v.as_ref())
    }

    /// Asynchronous notifications received so far.
    pub fn take_notifications(&mut self) -> impl Iterator<Item = NotificationResponse> + '_ {
        self.notifications.drain(..)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.log_level = level;
    }

    pub(crate) fn should_log(&self, level: LogLevel) -> bool {
        self.log_level.covers(level)
    }

    /// Whether an earlier fatal error killed this connection.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub(crate) fn die(&mut self) {
        self.dead = true;
    }

    /// Claim the connection for one query.
    pub(crate) fn lock(&mut self) -> Result<()> {
        if self.dead {
            return Err(ErrorKind::Dead.into());
        }
        if self.locked {
            return Err(ErrorKind::Busy.into());
        }
        self.locked = true;
        Ok(())
    }

    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }

    /// Record a query submission awaiting its ReadyForQuery.
    pub(crate) fn ready_request(&mut self) {
        self.pending_ready += 1;
    }

    /// Route a non-row message observed by the cursor or the drain loop.
    pub(crate) fn handle_async_message(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::ParameterStatus(param) => {
                self.run_params.insert(param.name, param.value);
            }
            BackendMessage::NoticeResponse(warn) => {
                if self.should_log(LogLevel::Warn) {
                    tracing::warn!(target: "postrow", "{}", warn.notice);
                }
            }
            BackendMessage::NotificationResponse(notification) => {
                self.notifications.push_back(notification);
            }
            BackendMessage::ReadyForQuery(_) => {
                self.pending_ready = self.pending_ready.saturating_sub(1);
            }
            _ => { } // completion chatter between pipelined phases
        }
    }

    /// Receive and decode the next backend message.
    ///
    /// Timeouts surface as non-fatal errors; any other receive failure
    /// kills the connection.
    pub(crate) async fn recv_message(&mut self, deadline: Option<Instant>) -> Result<BackendMessage> {
        if self.dead {
            return Err(ErrorKind::Dead.into());
        }

        if self.rmsgs.readable() == 0 {
            if let Err(err) = self.frontend.receive(&mut self.rmsgs, deadline).await {
                if !err.is_timeout() {
                    self.die();
                }
                return Err(err);
            }
        }
        self.last_activity = Instant::now();

        let frame = self.rmsgs.read().expect("receive returned with nothing readable");
        match BackendMessage::decode(frame.tag, frame.body) {
            Ok(message) => Ok(message),
            Err(err) => {
                self.die();
                Err(err.into())
            }
        }
    }

    /// Flush buffered frontend messages.
    ///
    /// A write failure may have left bytes on the wire, so any error here
    /// kills the connection.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        if let Err(err) = self.frontend.flush().await {
            self.die();
            return Err(err.into());
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Consume backend messages until every pending query submission has
    /// been answered with ReadyForQuery.
    ///
    /// Server errors observed while draining do not interrupt the drain;
    /// the connection returns to idle regardless.
    pub(crate) async fn drain_ready(&mut self) -> Result<()> {
        if self.dead {
            return Ok(());
        }
        if self.frontend.has_pending_write() {
            self.flush().await?;
        }

        while self.pending_ready != 0 {
            match self.recv_message(None).await? {
                BackendMessage::ErrorResponse(err) => {
                    if self.should_log(LogLevel::Warn) {
                        tracing::warn!(target: "postrow", "{}", err.error);
                    }
                }
                message => self.handle_async_message(message),
            }
        }
        Ok(())
    }

    /// Look up a cached prepared statement by SQL hash.
    pub(crate) fn get_stmt(&mut self, sqlid: u64) -> Option<Arc<PreparedStatement>> {
        self.stmts.get(&sqlid).cloned()
    }

    /// Cache a prepared statement.
    ///
    /// The evicted entry, if any, is closed server-side on the next round
    /// trip.
    pub(crate) fn add_stmt(&mut self, sqlid: u64, stmt: Arc<PreparedStatement>) {
        if let Some((_, evicted)) = self.stmts.push(sqlid, stmt) {
            self.frontend.send(frontend::Close {
                variant: b'S',
                name: evicted.name.as_str(),
            });
            self.frontend.send(frontend::Sync);
            self.ready_request();
        }
    }
}

/// Cancellation handle for the query in flight on a [`Connection`].
///
/// Obtained before the query starts; `cancel` opens a second connection
/// and issues a CancelRequest against the backend process.
#[derive(Clone, Debug)]
pub struct CancelToken {
    host: ByteStr,
    port: u16,
    process_id: u32,
    secret_key: u32,
}

impl CancelToken {
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = match self.host.as_ref() {
            "localhost" => {
                Socket::connect_socket(&format!("/run/postgresql/.s.PGSQL.{}", self.port)).await?
            }
            host => Socket::connect_tcp(host, self.port).await?,
        };

        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{ext::BufMutExt, statement::StatementName};

    fn msg(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
        out.put_u8(tag);
        out.put_i32(4 + body.len() as i32);
        out.put_slice(body);
    }

    #[tokio::test]
    async fn lock_rejects_reentry() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);

        conn.lock().unwrap();
        let err = conn.lock().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Busy));

        conn.unlock();
        conn.lock().unwrap();
    }

    #[tokio::test]
    async fn dead_connection_fails_fast() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);
        conn.die();

        assert!(matches!(conn.lock().unwrap_err().kind(), ErrorKind::Dead));
        assert!(matches!(
            conn.recv_message(None).await.unwrap_err().kind(),
            ErrorKind::Dead,
        ));
    }

    #[tokio::test]
    async fn drain_counts_every_pending_ready() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);
        conn.ready_request();
        conn.ready_request();

        let mut t = Vec::new();
        msg(&mut t, b'C', b"SELECT 1\0");
        msg(&mut t, b'Z', b"I");
        msg(&mut t, b'S', b"TimeZone\0UTC\0");
        msg(&mut t, b'Z', b"I");
        server.write_all(&t).await.unwrap();

        conn.drain_ready().await.unwrap();
        assert_eq!(conn.pending_ready, 0);
        assert_eq!(conn.parameter("TimeZone"), Some("UTC"));
    }

    #[tokio::test]
    async fn stmt_cache_eviction_closes_server_side() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);

        for id in 0..=DEFAULT_PREPARED_STMT_CACHE.get() as u64 {
            conn.add_stmt(
                id,
                Arc::new(PreparedStatement {
                    name: StatementName::next(),
                    sql: String::new(),
                    param_oids: Vec::new(),
                    fields: Vec::new(),
                }),
            );
        }

        // one entry fell out of the lru and its Close/Sync is buffered
        assert_eq!(conn.pending_ready, 1);
        assert!(conn.frontend.has_pending_write());
        assert!(conn.get_stmt(0).is_none());
        assert!(conn.get_stmt(1).is_some());
    }

    #[tokio::test]
    async fn startup_cleartext_password() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);
        conn.run_params.clear();

        let mut t = Vec::new();
        msg(&mut t, b'R', &3u32.to_be_bytes()); // CleartextPassword
        msg(&mut t, b'R', &0u32.to_be_bytes()); // Ok
        msg(&mut t, b'S', b"server_version\017.0\0");
        let mut key = Vec::new();
        key.put_u32(1234);
        key.put_u32(5678);
        msg(&mut t, b'K', &key);
        msg(&mut t, b'Z', b"I");
        server.write_all(&t).await.unwrap();

        let config = Config::parse("postgres://alice:secret@db:5432/app").unwrap();
        conn.startup(&config).await.unwrap();

        assert_eq!(conn.parameter("server_version"), Some("17.0"));
        let token = conn.cancel_token().expect("backend key data stored");
        let _ = token;

        // the startup and password messages went out
        let mut sent = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut sent).await.unwrap();
        let sent = &sent[..n];
        assert!(sent.windows(7).any(|w| w == b"secret\0"), "password message sent");
    }

    #[tokio::test]
    async fn startup_md5_is_unsupported() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = Connection::pipe(client);

        let mut body = Vec::new();
        body.put_u32(5);
        body.put_u32(0xdeadbeef);
        let mut t = Vec::new();
        msg(&mut t, b'R', &body);
        server.write_all(&t).await.unwrap();

        let config = Config::parse("postgres://alice:secret@db:5432/app").unwrap();
        let err = conn.startup(&config).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnsupportedAuth));
    }
}
