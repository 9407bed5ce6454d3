use pvwire_frame::{command_name, Command, ControlCommand, Header, WireReader};
use pvwire_transport::PvaStream;
use tracing::{trace, warn};

use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::message::TextMessage;

/// Behavior that differs between the client and server end of a
/// connection.
///
/// The connection engine owns the role on its receiver thread and calls the
/// hooks from there only, so a role needs no internal locking.
pub trait ConnectionRole: Send + 'static {
    /// Does this end receive messages flagged as server-originated?
    fn expects_server_messages(&self) -> bool;

    /// Produce the connected socket. Clients connect here; servers hand over
    /// the socket they accepted.
    fn initialize_socket(&mut self, conn: &Connection) -> Result<PvaStream>;

    /// Called once the socket is installed, before the first read.
    fn on_connected(&mut self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Handle a control message. The header is the entire message.
    fn handle_control(&mut self, conn: &Connection, header: &Header) -> pvwire_frame::Result<()> {
        default_control(conn, header);
        Ok(())
    }

    /// Handle an application message.
    fn handle_application(
        &mut self,
        conn: &Connection,
        header: &Header,
        payload: &mut WireReader<'_>,
    ) -> pvwire_frame::Result<()> {
        default_application(conn, header, payload)
    }

    /// Called when the receiver thread exits. `error` is set when it exited
    /// because of a connection-fatal error rather than an orderly close.
    fn on_receiver_exit(&mut self, _conn: &Connection, _error: Option<&PeerError>) {}
}

/// Fallback for control messages no role handles.
pub fn default_control(conn: &Connection, header: &Header) {
    let name = ControlCommand::try_from(header.command).map_or("UNKNOWN", |c| c.name());
    warn!(
        peer = %conn.name(),
        command = header.command,
        name,
        "unhandled control message"
    );
}

/// Fallback for application messages: text notifications are logged, other
/// commands are reported as unhandled.
pub fn default_application(
    conn: &Connection,
    header: &Header,
    payload: &mut WireReader<'_>,
) -> pvwire_frame::Result<()> {
    if header.command == Command::Message.code() {
        let message = TextMessage::decode(payload)?;
        message.log(conn.name());
        return Ok(());
    }
    warn!(
        peer = %conn.name(),
        command = header.command,
        name = command_name(header.command),
        size = header.payload_size,
        "unhandled command"
    );
    trace!(remaining = payload.remaining(), "skipping payload");
    Ok(())
}
