use std::net::SocketAddr;
use std::sync::Arc;

use pvwire_frame::{
    CommandHandler, CommandHandlers, Command, ControlCommand, Header, WireReader,
};
use pvwire_transport::{PlainSocketFactory, PvaStream, SocketFactory};
use tracing::{debug, error, trace, warn};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::control::echo_response;
use crate::error::{PeerError, Result};
use crate::pool::ThreadPool;
use crate::role::{default_application, default_control, ConnectionRole};
use crate::validation::{Status, ValidationReply, ValidationRequest, DEFAULT_REGISTRY_SIZE};

type ExitHook = Box<dyn FnMut(&Connection, Option<&PeerError>) + Send>;

/// Client end of a connection.
///
/// Connects through a [`SocketFactory`], answers connection validation and
/// starts the sender once the server confirmed it.
pub struct ClientRole {
    addr: SocketAddr,
    factory: Arc<dyn SocketFactory>,
    secure: bool,
    handlers: CommandHandlers<Connection>,
    on_exit: Option<ExitHook>,
}

impl ClientRole {
    pub fn new(addr: SocketAddr, factory: Arc<dyn SocketFactory>) -> Self {
        let mut handlers = CommandHandlers::new();
        // Registration on an empty table cannot collide.
        let _ = handlers.register(Command::ConnectionValidation, on_validation);
        let _ = handlers.register(Command::ConnectionValidated, on_validated);
        Self {
            addr,
            factory,
            secure: false,
            handlers,
            on_exit: None,
        }
    }

    /// Request a secure socket from the factory.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Handle an additional application command. Echo replies are only
    /// traced unless a handler is registered for them.
    pub fn with_handler<H>(mut self, command: Command, handler: H) -> Result<Self>
    where
        H: CommandHandler<Connection> + 'static,
    {
        self.handlers.register(command, handler)?;
        Ok(self)
    }

    /// Run `hook` when the receiver exits.
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Connection, Option<&PeerError>) + Send + 'static,
    {
        self.on_exit = Some(Box::new(hook));
        self
    }
}

impl ConnectionRole for ClientRole {
    fn expects_server_messages(&self) -> bool {
        true
    }

    fn initialize_socket(&mut self, _conn: &Connection) -> Result<PvaStream> {
        debug!(addr = %self.addr, secure = self.secure, "connecting");
        Ok(self.factory.connect(self.addr, self.secure)?)
    }

    fn handle_control(&mut self, conn: &Connection, header: &Header) -> pvwire_frame::Result<()> {
        match ControlCommand::try_from(header.command) {
            Ok(ControlCommand::SetByteOrder) => {
                conn.set_peer_version(header.version);
                conn.set_send_order(header.order());
                debug!(
                    peer = %conn.name(),
                    version = header.version,
                    order = ?header.order(),
                    "server byte order"
                );
            }
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
        if header.command == Command::Echo.code() {
            trace!(peer = %conn.name(), size = payload.remaining(), "echo reply");
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

fn on_validation(
    conn: &mut Connection,
    header: &Header,
    payload: &mut WireReader<'_>,
) -> pvwire_frame::Result<()> {
    let request = ValidationRequest::decode(payload)?;
    let own = conn.config().receive_buffer_size;
    let server = usize::try_from(request.buffer_size).unwrap_or(0);
    conn.set_peer_buffer_size(own.min(server).max(1));
    conn.set_peer_version(header.version);

    let reply = ValidationReply {
        buffer_size: i32::try_from(own).unwrap_or(i32::MAX),
        registry_size: DEFAULT_REGISTRY_SIZE,
        qos: 0,
        auth_method: request.choose_auth().to_string(),
    };
    debug!(
        peer = %conn.name(),
        buffer = conn.peer_buffer_size(),
        auth = %reply.auth_method,
        "answering connection validation"
    );
    conn.send_now(&reply)
}

fn on_validated(
    conn: &mut Connection,
    _header: &Header,
    payload: &mut WireReader<'_>,
) -> pvwire_frame::Result<()> {
    let status = Status::decode(payload)?;
    if !status.is_success() {
        error!(peer = %conn.name(), ?status, "server rejected connection validation");
        conn.close(false);
        return Ok(());
    }
    conn.start_sender()?;
    conn.mark_ready();
    debug!(peer = %conn.name(), "connection validated");
    Ok(())
}

/// Connect to a server with plain TCP and start the connection.
///
/// The returned connection is not validated yet; use
/// [`Connection::wait_ready`] to wait for it.
pub fn connect(addr: SocketAddr, pool: &ThreadPool, config: ConnectionConfig) -> Result<Connection> {
    let factory = Arc::new(PlainSocketFactory::with_timeout(config.connect_timeout));
    connect_with(ClientRole::new(addr, factory), addr, pool, config)
}

/// Start a connection with an explicitly configured client role.
pub fn connect_with(
    role: ClientRole,
    addr: SocketAddr,
    pool: &ThreadPool,
    config: ConnectionConfig,
) -> Result<Connection> {
    Connection::start(role, addr.to_string(), pool, config)
}
