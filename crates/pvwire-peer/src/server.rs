use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use pvwire_frame::{
    Command, CommandHandler, CommandHandlers, ControlCommand, Header, RawMessage, WireReader,
};
use pvwire_transport::{PvaStream, TcpTransport};
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::control::{echo_response, set_byte_order};
use crate::error::{PeerError, Result};
use crate::pool::ThreadPool;
use crate::role::{default_application, default_control, ConnectionRole};
use crate::validation::{
    Status, Validated, ValidationReply, ValidationRequest, AUTH_ANONYMOUS, AUTH_CA,
    DEFAULT_REGISTRY_SIZE,
};

type ExitHook = Box<dyn FnMut(&Connection, Option<&PeerError>) + Send>;

/// Server end of a connection, built around an accepted socket.
///
/// Opens with the byte order announcement and the validation request, then
/// confirms the client's reply. Echo requests are answered with the same
/// payload.
pub struct ServerRole {
    stream: Option<PvaStream>,
    auth_methods: Vec<String>,
    handlers: CommandHandlers<Connection>,
    on_exit: Option<ExitHook>,
}

impl ServerRole {
    pub fn new(stream: PvaStream) -> Self {
        let mut handlers = CommandHandlers::new();
        let _ = handlers.register(Command::ConnectionValidation, on_validation_reply);
        let _ = handlers.register(Command::Echo, on_echo);
        Self {
            stream: Some(stream),
            auth_methods: vec![AUTH_ANONYMOUS.to_string(), AUTH_CA.to_string()],
            handlers,
            on_exit: None,
        }
    }

    /// Override the authentication methods offered to clients.
    pub fn with_auth_methods(mut self, methods: Vec<String>) -> Self {
        self.auth_methods = methods;
        self
    }

    /// Handle an additional application command.
    pub fn with_handler<H>(mut self, command: Command, handler: H) -> Result<Self>
    where
        H: CommandHandler<Connection> + 'static,
    {
        self.handlers.register(command, handler)?;
        Ok(self)
    }

    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Connection, Option<&PeerError>) + Send + 'static,
    {
        self.on_exit = Some(Box::new(hook));
        self
    }
}

impl ConnectionRole for ServerRole {
    fn expects_server_messages(&self) -> bool {
        false
    }

    fn initialize_socket(&mut self, _conn: &Connection) -> Result<PvaStream> {
        self.stream.take().ok_or(PeerError::NotConnected)
    }

    fn on_connected(&mut self, conn: &Connection) -> Result<()> {
        conn.start_sender()?;
        conn.submit(set_byte_order())?;
        conn.submit(ValidationRequest {
            buffer_size: i32::try_from(conn.config().receive_buffer_size).unwrap_or(i32::MAX),
            registry_size: DEFAULT_REGISTRY_SIZE,
            auth_methods: self.auth_methods.clone(),
        })?;
        debug!(peer = %conn.name(), "validation requested");
        Ok(())
    }

    fn handle_control(&mut self, conn: &Connection, header: &Header) -> pvwire_frame::Result<()> {
        match ControlCommand::try_from(header.command) {
            Ok(ControlCommand::EchoRequest) => {
                if let Err(err) = conn.submit(echo_response(header.payload_size)) {
                    warn!(peer = %conn.name(), error = %err, "cannot answer echo request");
                }
            }
            Ok(ControlCommand::EchoResponse) => {
                trace!(peer = %conn.name(), "echo response");
            }
            _ => default_control(conn, header),
        }
        Ok(())
    }

    fn handle_application(
        &mut self,
        conn: &Connection,
        header: &Header,
        payload: &mut WireReader<'_>,
    ) -> pvwire_frame::Result<()> {
        let mut ctx = conn.clone();
        if self.handlers.dispatch(&mut ctx, header, payload)? {
            return Ok(());
        }
        default_application(conn, header, payload)
    }

    fn on_receiver_exit(&mut self, conn: &Connection, error: Option<&PeerError>) {
        if let Some(hook) = self.on_exit.as_mut() {
            hook(conn, error);
        }
    }
}

fn on_validation_reply(
    conn: &mut Connection,
    header: &Header,
    payload: &mut WireReader<'_>,
) -> pvwire_frame::Result<()> {
    let reply = ValidationReply::decode(payload)?;
    let own = conn.config().receive_buffer_size;
    let client = usize::try_from(reply.buffer_size).unwrap_or(0);
    conn.set_peer_buffer_size(own.min(client).max(1));
    conn.set_peer_version(header.version);
    debug!(
        peer = %conn.name(),
        version = header.version,
        buffer = conn.peer_buffer_size(),
        auth = %reply.auth_method,
        "client validated"
    );
    if let Err(err) = conn.submit(Validated(Status::Ok)) {
        warn!(peer = %conn.name(), error = %err, "cannot confirm validation");
        return Ok(());
    }
    conn.mark_ready();
    Ok(())
}

fn on_echo(
    conn: &mut Connection,
    _header: &Header,
    payload: &mut WireReader<'_>,
) -> pvwire_frame::Result<()> {
    let data = Bytes::copy_from_slice(payload.rest());
    payload.skip(data.len())?;
    if let Err(err) = conn.submit(RawMessage::new(Command::Echo, data)) {
        warn!(peer = %conn.name(), error = %err, "cannot answer echo");
    }
    Ok(())
}

/// Accepts client connections and starts a server-side [`Connection`] for
/// each.
pub struct PvaListener {
    transport: TcpTransport,
    pool: ThreadPool,
    config: ConnectionConfig,
    auth_methods: Option<Vec<String>>,
    next_id: AtomicU64,
}

impl PvaListener {
    /// Bind a listener. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr, pool: &ThreadPool, config: ConnectionConfig) -> Result<Self> {
        Ok(Self {
            transport: TcpTransport::bind(addr)?,
            pool: pool.clone(),
            config,
            auth_methods: None,
            next_id: AtomicU64::new(1),
        })
    }

    /// Override the authentication methods offered to clients.
    pub fn with_auth_methods(mut self, methods: Vec<String>) -> Self {
        self.auth_methods = Some(methods);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Accept the next client (blocking) and start its connection.
    pub fn accept(&self) -> Result<Connection> {
        let (stream, _) = self.transport.accept()?;
        let mut role = ServerRole::new(stream);
        if let Some(methods) = &self.auth_methods {
            role = role.with_auth_methods(methods.clone());
        }
        self.accept_with(role)
    }

    /// Start a connection for an already accepted socket wrapped in `role`.
    pub fn accept_with(&self, role: ServerRole) -> Result<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Connection::start(role, format!("client-{id}"), &self.pool, self.config.clone())
    }

    /// Accept the next socket without starting a connection, so the caller
    /// can configure the role first.
    pub fn accept_stream(&self) -> Result<PvaStream> {
        Ok(self.transport.accept()?.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::connect;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            shutdown_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn accept_names_connections_in_order() {
        let pool = ThreadPool::new("srv-names");
        let listener =
            PvaListener::bind("127.0.0.1:0".parse().expect("addr"), &pool, config()).expect("bind");
        let addr = listener.local_addr();

        let first = connect(addr, &pool, config()).expect("first client");
        let a = listener.accept().expect("first accept");
        let second = connect(addr, &pool, config()).expect("second client");
        let b = listener.accept().expect("second accept");

        assert_eq!(a.name(), "client-1");
        assert_eq!(b.name(), "client-2");
        assert!(a.is_server());

        for conn in [first, second, a, b] {
            conn.close(true);
        }
    }
}
