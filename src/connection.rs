//! The worker: one task per backend connection.
//!
//! A worker owns its socket and all buffers; nothing else reads or writes
//! them. Each loop iteration pops one command from the command channel,
//! services it, clears the write buffer, and publishes its index on the
//! ready channel iff no further commands are buffered (publishing only when
//! idle keeps a worker from being chosen for more work than its inbound
//! queue can absorb).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;

use crate::config::{Config, Network};
use crate::error::{Error, PgError, Result};
use crate::protocol::{
    BackendMessage, Bind, Describe, Execute, FrontendMessage, Parse, PasswordMessage,
    SaslInitialResponse, SaslResponse, SslRequest, StartupMessage, Sync,
};
use crate::query::{CommandTag, Query};
use crate::scram::ScramClient;
use crate::statement::Description;
use crate::tls;

// Worker status values, shared with the pool as a relaxed hint.
#[allow(dead_code)]
pub(crate) const STATUS_UNKNOWN: u8 = 0;
pub(crate) const STATUS_UNINITIALIZED: u8 = 1;
pub(crate) const STATUS_CONNECTING: u8 = 2;
pub(crate) const STATUS_IDLE: u8 = 3;
pub(crate) const STATUS_BUSY: u8 = 4;
pub(crate) const STATUS_CLOSED: u8 = 5;

/// Inbound worker commands.
pub(crate) enum Command {
    /// Perform the startup dialog and acknowledge the outcome.
    Connect {
        config: Box<Config>,
        done: oneshot::Sender<Result<()>>,
    },
    /// Single-shot extended query through the unnamed statement.
    #[allow(dead_code)]
    Query(Arc<Query>),
    /// Parse + Describe(statement) + Sync, populating the query's
    /// description.
    Prepare(Arc<Query>),
    /// Same wire traffic as `Prepare` but the description is left alone;
    /// used to replicate an already-known statement to other connections.
    PrepareAsync(Arc<Query>),
    /// Bind + trailer against a named prepared statement.
    PreparedQuery(Arc<Query>),
    /// Reserved for ahead-of-time caching; wire-identical to `Query`.
    #[allow(dead_code)]
    FuncCache(Arc<Query>),
}

/// The connection stream; TLS is negotiated before this is constructed.
enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            Socket::Unix(s) => s.read_buf(buf).await,
            Socket::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(data).await,
            #[cfg(unix)]
            Socket::Unix(s) => s.write(data).await,
            Socket::Tls(s) => s.write(data).await,
        }
    }
}

fn classify_io(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout(err),
        _ => Error::Io(err),
    }
}

pub(crate) struct Worker {
    index: usize,
    status: Arc<AtomicU8>,
    socket: Option<Socket>,
    write_buf: BytesMut,
    /// Pre-encoded Describe('P') + Execute + Sync, appended unchanged after
    /// every Bind.
    trailer_buf: Bytes,
    read_buf: BytesMut,
    peeked: Option<BackendMessage>,
    pid: u32,
    /// Key for a cancel-request message; cancellation itself is not wired
    /// up.
    #[allow(dead_code)]
    secret_key: u32,
    parameter_statuses: HashMap<String, String>,
    #[allow(dead_code)]
    tx_status: u8,
    command_rx: flume::Receiver<Command>,
    ready_tx: flume::Sender<usize>,
}

impl Worker {
    /// Create a worker and run it on its own task.
    pub(crate) fn spawn(
        index: usize,
        status: Arc<AtomicU8>,
        command_rx: flume::Receiver<Command>,
        ready_tx: flume::Sender<usize>,
    ) {
        let worker = Worker::new(index, status, command_rx, ready_tx);
        tokio::spawn(worker.run());
    }

    fn new(
        index: usize,
        status: Arc<AtomicU8>,
        command_rx: flume::Receiver<Command>,
        ready_tx: flume::Sender<usize>,
    ) -> Worker {
        status.store(STATUS_UNINITIALIZED, Ordering::Relaxed);

        let mut trailer = BytesMut::with_capacity(22);
        Describe { object_type: b'P', name: "" }.encode(&mut trailer);
        Execute.encode(&mut trailer);
        Sync.encode(&mut trailer);

        Worker {
            index,
            status,
            socket: None,
            write_buf: BytesMut::with_capacity(1024),
            trailer_buf: trailer.freeze(),
            read_buf: BytesMut::new(),
            peeked: None,
            pid: 0,
            secret_key: 0,
            parameter_statuses: HashMap::new(),
            tx_status: 0,
            command_rx,
            ready_tx,
        }
    }

    async fn run(mut self) {
        loop {
            let command = match self.command_rx.recv_async().await {
                Ok(command) => command,
                Err(_) => return,
            };
            match command {
                Command::Connect { config, done } => {
                    self.status.store(STATUS_CONNECTING, Ordering::Relaxed);
                    let outcome = self.connect(&config).await;
                    match &outcome {
                        Ok(()) => {
                            self.status.store(STATUS_IDLE, Ordering::Relaxed);
                            tracing::debug!(worker = self.index, pid = self.pid, "connected");
                        }
                        Err(err) => {
                            self.set_closed();
                            tracing::warn!(worker = self.index, %err, "connect failed");
                        }
                    }
                    let _ = done.send(outcome);
                }
                Command::Query(query) | Command::FuncCache(query) => {
                    self.status.store(STATUS_BUSY, Ordering::Relaxed);
                    self.exec_params(&query).await;
                    query.release_latch();
                }
                Command::Prepare(query) => {
                    self.status.store(STATUS_BUSY, Ordering::Relaxed);
                    self.prepare(&query, true).await;
                    query.release_latch();
                }
                Command::PrepareAsync(query) => {
                    self.status.store(STATUS_BUSY, Ordering::Relaxed);
                    self.prepare(&query, false).await;
                    query.close();
                }
                Command::PreparedQuery(query) => {
                    self.status.store(STATUS_BUSY, Ordering::Relaxed);
                    self.exec_prepared(&query).await;
                    query.release_latch();
                }
            }
            self.ready().await;
        }
    }

    /// Reset the write buffer and, when no commands are queued, publish the
    /// worker index to the ready set. A closed worker stays out of the
    /// ready set.
    async fn ready(&mut self) {
        self.write_buf.clear();
        if self.status.load(Ordering::Relaxed) == STATUS_CLOSED {
            return;
        }
        if self.command_rx.is_empty() {
            self.status.store(STATUS_IDLE, Ordering::Relaxed);
            let _ = self.ready_tx.send_async(self.index).await;
        }
    }

    fn set_closed(&mut self) {
        self.status.store(STATUS_CLOSED, Ordering::Relaxed);
        self.socket = None;
    }

    // ========================================================================
    // Startup
    // ========================================================================

    async fn connect(&mut self, config: &Config) -> Result<()> {
        let connect_err = |message: String, source: Option<io::Error>| Error::Connect {
            host: config.host.clone(),
            user: config.user.clone(),
            database: config.database.clone(),
            message,
            source,
        };

        let socket = match config.network_address() {
            Network::Tcp(addr) => {
                let dial = TcpStream::connect(&addr);
                let stream = match config.connect_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, dial)
                        .await
                        .map_err(|_| {
                            Error::Timeout(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "connect timed out",
                            ))
                        })?
                        .map_err(|e| connect_err("dial error".into(), Some(e)))?,
                    None => dial
                        .await
                        .map_err(|e| connect_err("dial error".into(), Some(e)))?,
                };
                stream
                    .set_nodelay(true)
                    .map_err(|e| connect_err("dial error".into(), Some(e)))?;
                self.negotiate_tls(stream, config).await?
            }
            #[cfg(unix)]
            Network::Unix(path) => {
                // TLS is never requested over a Unix-domain socket
                let stream = UnixStream::connect(&path)
                    .await
                    .map_err(|e| connect_err("dial error".into(), Some(e)))?;
                Socket::Unix(stream)
            }
            #[cfg(not(unix))]
            Network::Unix(_) => {
                return Err(connect_err(
                    "unix-domain sockets are not supported on this platform".into(),
                    None,
                ));
            }
        };
        self.socket = Some(socket);
        self.read_buf.reserve(config.min_read_buffer_size);
        self.parameter_statuses.clear();
        self.peeked = None;

        // startup packet: runtime parameters, then user and database; the
        // worker index is appended to application_name so sessions are
        // distinguishable server-side
        let mut parameters: Vec<(String, String)> = Vec::new();
        for (key, value) in &config.runtime_params {
            let mut value = value.clone();
            if key == "application_name" {
                value.push_str(&self.index.to_string());
            }
            parameters.push((key.clone(), value));
        }
        parameters.push(("user".to_string(), config.user.clone()));
        if !config.database.is_empty() {
            parameters.push(("database".to_string(), config.database.clone()));
        }

        self.send_message(&StartupMessage { parameters })
            .await
            .map_err(|e| connect_err(format!("failed to write startup message ({e})"), None))?;

        loop {
            let msg = match self.receive_message().await {
                Ok(msg) => msg,
                Err(err @ Error::Pg(_)) => return Err(err),
                Err(err) => {
                    return Err(connect_err(format!("failed to receive message ({err})"), None))
                }
            };

            match msg {
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.pid = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = config
                        .password
                        .as_deref()
                        .ok_or_else(|| connect_err("password required".into(), None))?;
                    self.send_message(&PasswordMessage { password })
                        .await
                        .map_err(|e| {
                            connect_err(format!("failed to write password message ({e})"), None)
                        })?;
                }
                BackendMessage::AuthenticationMd5Password { salt } => {
                    let password = config
                        .password
                        .as_deref()
                        .ok_or_else(|| connect_err("password required".into(), None))?;
                    let digested = md5_password(&config.user, password, &salt);
                    self.send_message(&PasswordMessage {
                        password: &digested,
                    })
                    .await
                    .map_err(|e| {
                        connect_err(format!("failed to write password message ({e})"), None)
                    })?;
                }
                BackendMessage::AuthenticationSasl { mechanisms } => {
                    self.scram_auth(&mechanisms, config).await?;
                }
                BackendMessage::ParameterStatus { .. } => {
                    // recorded by receive_message
                }
                BackendMessage::ReadyForQuery { .. } => {
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.set_closed();
                    return Err(Error::pg(PgError::from_fields(&fields)));
                }
                _ => {
                    return Err(connect_err("received unexpected message".into(), None));
                }
            }
        }
    }

    /// Send the TLS request pseudo-packet when the settings call for it and
    /// wrap the stream accordingly.
    async fn negotiate_tls(&mut self, mut stream: TcpStream, config: &Config) -> Result<Socket> {
        if !config.ssl_mode.request_tls() {
            return Ok(Socket::Tcp(stream));
        }

        let mut request = BytesMut::with_capacity(8);
        SslRequest.encode(&mut request);
        stream.write_all(&request).await.map_err(classify_io)?;

        let mut response = [0u8; 1];
        stream
            .read_exact(&mut response)
            .await
            .map_err(classify_io)?;

        match response[0] {
            b'S' => {
                let connector = tls::connector(config)?;
                let name = tls::server_name(&config.host)?;
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::Connect {
                        host: config.host.clone(),
                        user: config.user.clone(),
                        database: config.database.clone(),
                        message: "tls error".into(),
                        source: Some(e),
                    })?;
                Ok(Socket::Tls(Box::new(stream)))
            }
            _ if config.ssl_mode.require_tls() => Err(Error::Connect {
                host: config.host.clone(),
                user: config.user.clone(),
                database: config.database.clone(),
                message: "server refused TLS connection".into(),
                source: None,
            }),
            // sslmode=prefer degrades to cleartext
            _ => Ok(Socket::Tcp(stream)),
        }
    }

    async fn scram_auth(&mut self, mechanisms: &[String], config: &Config) -> Result<()> {
        let connect_err = |message: String| Error::Connect {
            host: config.host.clone(),
            user: config.user.clone(),
            database: config.database.clone(),
            message,
            source: None,
        };

        if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
            return Err(connect_err(format!(
                "server requires unsupported SASL mechanisms: {mechanisms:?}"
            )));
        }
        let password = config
            .password
            .as_deref()
            .ok_or_else(|| connect_err("password required".into()))?;

        let mut scram = ScramClient::new(&config.user, password);
        let client_first = scram.client_first_message();
        self.send_message(&SaslInitialResponse {
            mechanism: "SCRAM-SHA-256",
            data: &client_first,
        })
        .await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSaslContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| connect_err(format!("failed SASL auth ({e})")))?;
                    self.send_message(&SaslResponse {
                        data: &client_final,
                    })
                    .await?;
                }
                BackendMessage::AuthenticationSaslFinal { data } => {
                    scram
                        .verify_server_final(&data)
                        .map_err(|e| connect_err(format!("failed SASL auth ({e})")))?;
                    return Ok(());
                }
                BackendMessage::AuthenticationOk => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    return Err(Error::pg(PgError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    // ========================================================================
    // Message intake
    // ========================================================================

    /// Read one message from the backend unless one is already buffered. On
    /// any error other than a timeout the worker is marked closed.
    async fn peek_message(&mut self) -> Result<()> {
        if self.peeked.is_some() {
            return Ok(());
        }
        match self.read_message().await {
            Ok(msg) => {
                self.peeked = Some(msg);
                Ok(())
            }
            Err(err) => {
                if !err.is_timeout() {
                    self.set_closed();
                }
                Err(err)
            }
        }
    }

    /// Consume the peeked message, applying the transparent side effects:
    /// transaction status, parameter status, FATAL errors (which close the
    /// connection), and dropped notices/notifications (handler hooks
    /// reserved).
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        self.peek_message().await?;
        let msg = match self.peeked.take() {
            Some(msg) => msg,
            None => return Err(Error::Closed),
        };

        match &msg {
            BackendMessage::ReadyForQuery { status } => {
                self.tx_status = status.as_byte();
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameter_statuses.insert(name.clone(), value.clone());
            }
            BackendMessage::ErrorResponse { fields } => {
                let err = PgError::from_fields(fields);
                if err.is_fatal() {
                    tracing::warn!(worker = self.index, %err, "fatal server error");
                    self.set_closed();
                    return Err(Error::pg(err));
                }
            }
            BackendMessage::NoticeResponse { .. }
            | BackendMessage::NotificationResponse { .. } => {}
            _ => {}
        }

        Ok(msg)
    }

    async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            if self.read_buf.len() >= 5 {
                let len = i32::from_be_bytes([
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                ]) as usize;
                if len < 4 {
                    return Err(Error::Protocol("invalid message length".into()));
                }
                let total = len + 1;
                if self.read_buf.len() >= total {
                    let frame = self.read_buf.split_to(total).freeze();
                    return BackendMessage::decode(frame);
                }
            }

            let socket = self.socket.as_mut().ok_or(Error::Closed)?;
            let n = socket.read_buf(&mut self.read_buf).await.map_err(classify_io)?;
            if n == 0 {
                return Err(Error::Closed);
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> Result<()> {
        self.write_buf.clear();
        msg.encode(&mut self.write_buf);
        self.send_write_buf().await
    }

    /// Write the whole write buffer, tracking how many bytes reached the
    /// wire so a failure carries the retry hint.
    async fn send_write_buf(&mut self) -> Result<()> {
        let buf = std::mem::take(&mut self.write_buf);
        let result = Self::write_all(self.socket.as_mut(), &buf).await;
        self.write_buf = buf;
        result
    }

    async fn write_all(socket: Option<&mut Socket>, data: &[u8]) -> Result<()> {
        let Some(socket) = socket else {
            return Err(Error::Closed);
        };
        let mut written = 0usize;
        while written < data.len() {
            match socket.write(&data[written..]).await {
                Ok(0) => {
                    return Err(Error::Write {
                        source: io::Error::new(io::ErrorKind::WriteZero, "wrote zero bytes"),
                        safe_to_retry: written == 0,
                    })
                }
                Ok(n) => written += n,
                Err(source) => {
                    return Err(Error::Write {
                        source,
                        safe_to_retry: written == 0,
                    })
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Extended-query drivers
    // ========================================================================

    /// Single-shot round trip through the unnamed statement: Parse + Bind +
    /// trailer.
    async fn exec_params(&mut self, query: &Arc<Query>) {
        let Some(description) = query.description() else {
            query
                .state
                .lock()
                .result
                .conclude(None, Some(Error::Protocol("query has no description".into())));
            return;
        };

        self.write_buf.clear();
        {
            let state = query.state.lock();
            let param_oids = description.param_oids.read();
            Parse {
                name: "",
                query: &state.sql,
                param_oids: &param_oids,
            }
            .encode(&mut self.write_buf);
            encode_bind(&mut self.write_buf, "", &state, &description);
        }
        self.write_buf.extend_from_slice(&self.trailer_buf);

        if let Err(err) = self.send_write_buf().await {
            self.set_closed();
            query.state.lock().result.conclude(None, Some(err));
            return;
        }

        self.drive_execution(query, &description).await;
    }

    /// Bind + pre-encoded trailer against the named statement.
    async fn exec_prepared(&mut self, query: &Arc<Query>) {
        let Some(description) = query.description() else {
            query
                .state
                .lock()
                .result
                .conclude(None, Some(Error::Protocol("query has no description".into())));
            return;
        };

        self.write_buf.clear();
        {
            let state = query.state.lock();
            encode_bind(&mut self.write_buf, &description.name, &state, &description);
        }
        self.write_buf.extend_from_slice(&self.trailer_buf);

        if let Err(err) = self.send_write_buf().await {
            self.set_closed();
            query.state.lock().result.conclude(None, Some(err));
            return;
        }

        self.drive_execution(query, &description).await;
    }

    /// Consume responses until ReadyForQuery, filling the query's result.
    async fn drive_execution(&mut self, query: &Arc<Query>, description: &Arc<Description>) {
        while !query.state.lock().result.command_concluded {
            let msg = match self.receive_message().await {
                Ok(msg) => msg,
                Err(err) => {
                    query.state.lock().result.conclude(None, Some(err));
                    return;
                }
            };
            match msg {
                BackendMessage::RowDescription { fields } => {
                    *description.fields.write() = fields;
                }
                BackendMessage::EmptyQueryResponse => {
                    query.state.lock().result.conclude(None, None);
                }
                BackendMessage::DataRow { values } => {
                    query.state.lock().result.row_values.extend(values);
                }
                BackendMessage::ErrorResponse { fields } => {
                    query
                        .state
                        .lock()
                        .result
                        .conclude(None, Some(Error::pg(PgError::from_fields(&fields))));
                }
                BackendMessage::CommandComplete { tag } => {
                    query
                        .state
                        .lock()
                        .result
                        .conclude(Some(CommandTag::new(tag)), None);
                }
                BackendMessage::ReadyForQuery { .. } => {
                    query.state.lock().result.command_concluded = true;
                }
                _ => {}
            }
        }
    }

    /// Parse + Describe(statement) + Sync. With `populate`, parameter OIDs
    /// and field descriptions accumulate into the shared description; the
    /// replication variant leaves it untouched.
    async fn prepare(&mut self, query: &Arc<Query>, populate: bool) {
        let Some(description) = query.description() else {
            query
                .state
                .lock()
                .result
                .conclude(None, Some(Error::Protocol("query has no description".into())));
            return;
        };

        self.write_buf.clear();
        {
            let state = query.state.lock();
            let param_oids = description.param_oids.read();
            Parse {
                name: &description.name,
                query: &state.sql,
                param_oids: &param_oids,
            }
            .encode(&mut self.write_buf);
        }
        Describe {
            object_type: b'S',
            name: &description.name,
        }
        .encode(&mut self.write_buf);
        Sync.encode(&mut self.write_buf);

        if let Err(err) = self.send_write_buf().await {
            self.set_closed();
            query.state.lock().result.conclude(None, Some(err));
            return;
        }

        let mut parse_err = None;
        while !query.state.lock().result.command_concluded {
            let msg = match self.receive_message().await {
                Ok(msg) => msg,
                Err(err) => {
                    query.state.lock().result.conclude(None, Some(err));
                    return;
                }
            };
            match msg {
                BackendMessage::ParameterDescription { param_oids } => {
                    if populate {
                        description.param_oids.write().extend(param_oids);
                    }
                }
                BackendMessage::RowDescription { fields } => {
                    if populate {
                        description.fields.write().extend(fields);
                    }
                }
                BackendMessage::ErrorResponse { fields } => {
                    parse_err = Some(Error::pg(PgError::from_fields(&fields)));
                }
                BackendMessage::ReadyForQuery { .. } => {
                    query.state.lock().result.command_concluded = true;
                }
                _ => {}
            }
        }

        // a parse failure is surfaced but does not close the connection
        if parse_err.is_some() {
            query.state.lock().result.err = parse_err;
        }
    }
}

/// Encode a Bind message from the query's recorded parameter ranges.
fn encode_bind(
    buf: &mut BytesMut,
    statement: &str,
    state: &crate::query::QueryState,
    description: &Description,
) {
    let values: smallvec::SmallVec<[Option<&[u8]>; 16]> = state
        .param_values
        .iter()
        .map(|range| range.map(|(start, end)| &state.param_value_bytes[start..end]))
        .collect();
    Bind {
        statement,
        param_formats: &state.param_formats,
        param_values: &values,
        result_formats: description.result_formats(),
    }
    .encode(buf);
}

/// `"md5" + md5_hex(md5_hex(password + user) + salt)`.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}").as_bytes()));
    let mut outer_input = inner.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::net::TcpListener;

    fn test_worker(
        socket: Option<Socket>,
    ) -> (Worker, flume::Sender<Command>, flume::Receiver<usize>) {
        let (cmd_tx, cmd_rx) = flume::bounded(16);
        let (ready_tx, ready_rx) = flume::bounded(4);
        let mut worker = Worker::new(0, Arc::new(AtomicU8::new(0)), cmd_rx, ready_tx);
        worker.socket = socket;
        (worker, cmd_tx, ready_rx)
    }

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(tag);
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn md5_password_digest() {
        // matches PostgreSQL's concat-then-hash order
        let digested = md5_password("user", "secret", &[1, 2, 3, 4]);
        assert!(digested.starts_with("md5"));
        assert_eq!(digested.len(), 35);

        let inner = format!("{:x}", md5::compute(b"secretuser"));
        let mut outer = inner.into_bytes();
        outer.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(digested, format!("md5{:x}", md5::compute(&outer)));
    }

    #[test]
    fn trailer_is_describe_execute_sync() {
        let (worker, _cmd, _ready) = test_worker(None);
        let t = &worker.trailer_buf;
        assert_eq!(t.len(), 22);
        assert_eq!(t[0], b'D');
        assert_eq!(t[5], b'P');
        assert_eq!(t[7], b'E');
        assert_eq!(t[17], b'S');
    }

    #[tokio::test]
    async fn receive_message_records_parameter_status() {
        let (client, mut server) = connected_pair().await;
        let (mut worker, _cmd, _ready) = test_worker(Some(Socket::Tcp(client)));

        let mut body = Vec::new();
        body.extend_from_slice(b"server_version\0");
        body.extend_from_slice(b"16.3\0");
        server.write_all(&frame(b'S', &body)).await.unwrap();

        let msg = worker.receive_message().await.unwrap();
        assert!(matches!(msg, BackendMessage::ParameterStatus { .. }));
        assert_eq!(
            worker.parameter_statuses.get("server_version").map(String::as_str),
            Some("16.3")
        );
    }

    #[tokio::test]
    async fn fatal_error_closes_worker() {
        let (client, mut server) = connected_pair().await;
        let (mut worker, _cmd, _ready) = test_worker(Some(Socket::Tcp(client)));
        worker.status.store(STATUS_IDLE, Ordering::Relaxed);

        server
            .write_all(&frame(
                b'E',
                b"SFATAL\0C57P01\0Mterminating connection\0\0",
            ))
            .await
            .unwrap();

        let err = worker.receive_message().await.unwrap_err();
        let pg = err.as_pg().expect("server error");
        assert_eq!(pg.code, "57P01");
        assert_eq!(worker.status.load(Ordering::Relaxed), STATUS_CLOSED);
        assert!(worker.socket.is_none());

        // the socket is gone, further reads fail without touching the wire
        assert!(matches!(
            worker.receive_message().await.unwrap_err(),
            Error::Closed
        ));
    }

    #[tokio::test]
    async fn peeked_message_is_consumed_once() {
        let (client, mut server) = connected_pair().await;
        let (mut worker, _cmd, _ready) = test_worker(Some(Socket::Tcp(client)));

        server.write_all(&frame(b'1', b"")).await.unwrap();
        server.write_all(&frame(b'2', b"")).await.unwrap();

        worker.peek_message().await.unwrap();
        assert!(matches!(
            worker.receive_message().await.unwrap(),
            BackendMessage::ParseComplete
        ));
        assert!(matches!(
            worker.receive_message().await.unwrap(),
            BackendMessage::BindComplete
        ));
    }

    #[tokio::test]
    async fn read_message_reassembles_split_frames() {
        let (client, mut server) = connected_pair().await;
        let (mut worker, _cmd, _ready) = test_worker(Some(Socket::Tcp(client)));

        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_i32(4);
        body.put_i32(42);
        let full = frame(b'D', &body);

        // deliver in two chunks with a flush gap
        server.write_all(&full[..3]).await.unwrap();
        server.flush().await.unwrap();
        let (tail, mut server) = (full[3..].to_vec(), server);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            server.write_all(&tail).await.unwrap();
        });

        match worker.read_message().await.unwrap() {
            BackendMessage::DataRow { values } => {
                assert_eq!(values[0].as_deref(), Some(&42i32.to_be_bytes()[..]));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_failure_carries_retry_hint() {
        let (client, server) = connected_pair().await;
        drop(server);
        let (mut worker, _cmd, _ready) = test_worker(Some(Socket::Tcp(client)));

        worker.write_buf.extend_from_slice(&[0u8; 1024]);
        // the peer is gone; depending on timing the first write may be
        // accepted into the socket buffer, so push until it fails
        let mut failed = None;
        for _ in 0..64 {
            worker.write_buf.resize(1 << 20, 0);
            if let Err(err) = worker.send_write_buf().await {
                failed = Some(err);
                break;
            }
        }
        if let Some(err) = failed {
            assert!(matches!(err, Error::Write { .. }));
        }
    }
}
