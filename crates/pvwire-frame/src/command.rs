//! Command codes.
//!
//! The numeric values are part of the wire protocol and must not change.

use std::fmt;

use crate::error::FrameError;

/// Application command codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Beacon = 0,
    ConnectionValidation = 1,
    Echo = 2,
    Search = 3,
    SearchResponse = 4,
    AuthNZ = 5,
    AclChange = 6,
    CreateChannel = 7,
    DestroyChannel = 8,
    ConnectionValidated = 9,
    Get = 10,
    Put = 11,
    PutGet = 12,
    Monitor = 13,
    Array = 14,
    DestroyRequest = 15,
    Process = 16,
    GetType = 17,
    Message = 18,
    MultipleData = 19,
    Rpc = 20,
    CancelRequest = 21,
    OriginTag = 22,
}

impl Command {
    pub const ALL: [Command; 23] = [
        Command::Beacon,
        Command::ConnectionValidation,
        Command::Echo,
        Command::Search,
        Command::SearchResponse,
        Command::AuthNZ,
        Command::AclChange,
        Command::CreateChannel,
        Command::DestroyChannel,
        Command::ConnectionValidated,
        Command::Get,
        Command::Put,
        Command::PutGet,
        Command::Monitor,
        Command::Array,
        Command::DestroyRequest,
        Command::Process,
        Command::GetType,
        Command::Message,
        Command::MultipleData,
        Command::Rpc,
        Command::CancelRequest,
        Command::OriginTag,
    ];

    /// Wire value of the command.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::Beacon => "BEACON",
            Command::ConnectionValidation => "VALIDATION",
            Command::Echo => "ECHO",
            Command::Search => "SEARCH",
            Command::SearchResponse => "SEARCH_RESPONSE",
            Command::AuthNZ => "AUTHNZ",
            Command::AclChange => "ACL_CHANGE",
            Command::CreateChannel => "CREATE_CHANNEL",
            Command::DestroyChannel => "DESTROY_CHANNEL",
            Command::ConnectionValidated => "VALIDATED",
            Command::Get => "GET",
            Command::Put => "PUT",
            Command::PutGet => "PUT_GET",
            Command::Monitor => "MONITOR",
            Command::Array => "ARRAY",
            Command::DestroyRequest => "DESTROY_REQUEST",
            Command::Process => "PROCESS",
            Command::GetType => "GET_TYPE",
            Command::Message => "MESSAGE",
            Command::MultipleData => "MULTIPLE_DATA",
            Command::Rpc => "RPC",
            Command::CancelRequest => "CANCEL_REQUEST",
            Command::OriginTag => "ORIGIN_TAG",
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.code()
    }
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .get(code as usize)
            .copied()
            .ok_or(FrameError::UnknownCommand(code))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Control command codes, carried in messages with the control flag set.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    SetMarker = 0,
    AckMarker = 1,
    SetByteOrder = 2,
    EchoRequest = 3,
    EchoResponse = 4,
}

impl ControlCommand {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            ControlCommand::SetMarker => "SET_MARKER",
            ControlCommand::AckMarker => "ACK_MARKER",
            ControlCommand::SetByteOrder => "SET_BYTE_ORDER",
            ControlCommand::EchoRequest => "ECHO_REQUEST",
            ControlCommand::EchoResponse => "ECHO_RESPONSE",
        }
    }
}

impl From<ControlCommand> for u8 {
    fn from(command: ControlCommand) -> u8 {
        command.code()
    }
}

impl TryFrom<u8> for ControlCommand {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ControlCommand::SetMarker),
            1 => Ok(ControlCommand::AckMarker),
            2 => Ok(ControlCommand::SetByteOrder),
            3 => Ok(ControlCommand::EchoRequest),
            4 => Ok(ControlCommand::EchoResponse),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-readable name of an application command code.
pub fn command_name(code: u8) -> &'static str {
    Command::try_from(code).map_or("UNKNOWN", Command::name)
}
