use crate::codec::Header;
use crate::error::{FrameError, Result};
use crate::wire::WireReader;

/// Handles one application command.
///
/// The payload reader borrows the receive buffer for the duration of the
/// call only; the borrow checker prevents handlers from keeping it.
pub trait CommandHandler<C>: Send {
    fn handle(&mut self, ctx: &mut C, header: &Header, payload: &mut WireReader<'_>) -> Result<()>;
}

impl<C, F> CommandHandler<C> for F
where
    F: FnMut(&mut C, &Header, &mut WireReader<'_>) -> Result<()> + Send,
{
    fn handle(&mut self, ctx: &mut C, header: &Header, payload: &mut WireReader<'_>) -> Result<()> {
        self(ctx, header, payload)
    }
}

/// Dense table mapping command codes to handlers.
///
/// The table grows to fit the largest registered code. Lookup is a single
/// index operation.
pub struct CommandHandlers<C> {
    table: Vec<Option<Box<dyn CommandHandler<C>>>>,
}

impl<C> Default for CommandHandlers<C> {
    fn default() -> Self {
        Self { table: Vec::new() }
    }
}

impl<C> CommandHandlers<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, failing if the code already has one.
    pub fn register<H>(&mut self, command: impl Into<u8>, handler: H) -> Result<()>
    where
        H: CommandHandler<C> + 'static,
    {
        let code = command.into();
        let index = code as usize;
        if self.table.len() <= index {
            self.table.resize_with(index + 1, || None);
        }
        if self.table[index].is_some() {
            return Err(FrameError::DuplicateHandler(code));
        }
        self.table[index] = Some(Box::new(handler));
        Ok(())
    }

    /// Builder form of [`CommandHandlers::register`].
    pub fn with<H>(mut self, command: impl Into<u8>, handler: H) -> Result<Self>
    where
        H: CommandHandler<C> + 'static,
    {
        self.register(command, handler)?;
        Ok(self)
    }

    pub fn contains(&self, command: u8) -> bool {
        matches!(self.table.get(command as usize), Some(Some(_)))
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.table.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the handler for `header.command`.
    ///
    /// Returns `Ok(false)` when no handler is registered; that is not an
    /// error and the caller moves on to the next message.
    pub fn dispatch(
        &mut self,
        ctx: &mut C,
        header: &Header,
        payload: &mut WireReader<'_>,
    ) -> Result<bool> {
        match self.table.get_mut(header.command as usize) {
            Some(Some(handler)) => {
                handler.handle(ctx, header, payload)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl<C> std::fmt::Debug for CommandHandlers<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes: Vec<usize> = self
            .table
            .iter()
            .enumerate()
            .filter_map(|(code, slot)| slot.as_ref().map(|_| code))
            .collect();
        f.debug_struct("CommandHandlers")
            .field("commands", &codes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, PROTOCOL_REVISION};
    use crate::command::Command;

    fn header(command: u8) -> Header {
        Header {
            version: PROTOCOL_REVISION,
            flags: 0,
            command,
            payload_size: 0,
        }
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let mut handlers = CommandHandlers::<Vec<u32>>::new()
            .with(
                Command::Echo,
                |seen: &mut Vec<u32>, _: &Header, r: &mut WireReader<'_>| -> Result<()> {
                    seen.push(r.get_u32()?);
                    Ok(())
                },
            )
            .unwrap();

        let mut seen = Vec::new();
        let payload = 7u32.to_le_bytes();
        let mut reader = WireReader::new(&payload, ByteOrder::Little);
        let found = handlers
            .dispatch(&mut seen, &header(Command::Echo.code()), &mut reader)
            .unwrap();

        assert!(found);
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn unknown_command_is_not_fatal() {
        let mut handlers = CommandHandlers::<()>::new();
        let mut reader = WireReader::new(&[], ByteOrder::Little);
        assert!(!handlers.dispatch(&mut (), &header(200), &mut reader).unwrap());
    }

    #[test]
    fn table_grows_to_largest_code() {
        let noop = |_: &mut (), _: &Header, _: &mut WireReader<'_>| -> Result<()> { Ok(()) };
        let mut handlers = CommandHandlers::<()>::new();
        handlers.register(Command::OriginTag, noop).unwrap();
        handlers.register(3u8, noop).unwrap();

        assert!(handlers.contains(22));
        assert!(handlers.contains(3));
        assert!(!handlers.contains(4));
        assert_eq!(handlers.len(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let noop = |_: &mut (), _: &Header, _: &mut WireReader<'_>| -> Result<()> { Ok(()) };
        let mut handlers = CommandHandlers::<()>::new();
        handlers.register(Command::Search, noop).unwrap();
        let err = handlers.register(Command::Search, noop).unwrap_err();
        assert!(matches!(err, FrameError::DuplicateHandler(3)));
    }

    #[test]
    fn handler_errors_propagate() {
        let mut handlers = CommandHandlers::<()>::new()
            .with(
                Command::Get,
                |_: &mut (), _: &Header, r: &mut WireReader<'_>| -> Result<()> {
                    r.get_u32().map(|_| ())
                },
            )
            .unwrap();
        let mut reader = WireReader::new(&[1], ByteOrder::Little);
        let err = handlers
            .dispatch(&mut (), &header(Command::Get.code()), &mut reader)
            .unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }
}
