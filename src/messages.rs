//! Encoding and decoding of CA protocol messages.
//!
//! Every message starts with a 16-byte big-endian header:
//!
//! ```text
//! +---------+--------------+-----------+------------+-------------+-------------+
//! | command | payload size | data type | data count | parameter 1 | parameter 2 |
//! |   u16   |     u16      |    u16    |    u16     |     u32     |     u32     |
//! +---------+--------------+-----------+------------+-------------+-------------+
//! ```
//!
//! When the payload size is the sentinel `0xFFFF` the header is followed by a
//! 32-bit payload size and a 32-bit element count ("large array" form). Payloads
//! are always padded to a multiple of eight bytes.
//!
//! Several commands are reused for a request and its response with different
//! field meanings, so decoding needs to know which way a message is travelling
//! ([`Direction`]).

use std::{
    fmt,
    io::{self, Cursor},
    net::Ipv4Addr,
    ops::BitOr,
};

use bytes::{Buf, BytesMut};
use nom::{
    IResult, Parser,
    number::streaming::{be_u16, be_u32},
};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::dbr::{DbrBasicType, DbrType, MAX_STRING_SIZE};

/// The CA minor protocol revision spoken by this crate
pub const CA_MINOR_PROTOCOL_REVISION: u16 = 13;
/// Oldest peer minor revision accepted on a circuit
pub const CA_MINIMUM_PROTOCOL_REVISION: u16 = 4;
/// Size of the plain header
pub const HEADER_SIZE: usize = 16;
/// Size of the header with the large-array extension
pub const LARGE_HEADER_SIZE: usize = 24;

const LARGE_SIZE_SENTINEL: u16 = 0xFFFF;
const SEARCH_DO_REPLY: u16 = 10;
const SEARCH_DONT_REPLY: u16 = 5;

pub mod command {
    pub const VERSION: u16 = 0;
    pub const EVENT_ADD: u16 = 1;
    pub const EVENT_CANCEL: u16 = 2;
    pub const WRITE: u16 = 4;
    pub const SEARCH: u16 = 6;
    pub const EVENTS_OFF: u16 = 8;
    pub const EVENTS_ON: u16 = 9;
    pub const ERROR: u16 = 11;
    pub const CLEAR_CHANNEL: u16 = 12;
    pub const RSRV_IS_UP: u16 = 13;
    pub const NOT_FOUND: u16 = 14;
    pub const READ_NOTIFY: u16 = 15;
    pub const CREATE_CHAN: u16 = 18;
    pub const WRITE_NOTIFY: u16 = 19;
    pub const CLIENT_NAME: u16 = 20;
    pub const HOST_NAME: u16 = 21;
    pub const ACCESS_RIGHTS: u16 = 22;
    pub const ECHO: u16 = 23;
    pub const CREATE_CH_FAIL: u16 = 26;
    pub const SERVER_DISCONN: u16 = 27;
}

/// Which way a message travels, needed to tell requests from responses
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Sent by a client, received by a server
    ToServer,
    /// Sent by a server, received by a client
    ToClient,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    /// Not enough bytes yet. Buffer more and try again.
    #[error("Incomplete message: need {needed} more bytes")]
    ShortRead { needed: usize },
    /// The byte stream can no longer be trusted
    #[error("Malformed message header: {0}")]
    MalformedHeader(String),
    /// Skip `length` bytes and carry on
    #[error("Unknown command {command} ({length} bytes)")]
    UnknownCommand { command: u16, length: usize },
    #[error("Payload of {size} bytes exceeds the limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Decoded fixed header, with the large-array extension folded in
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
}

fn u16_be(input: &[u8]) -> IResult<&[u8], u16> {
    be_u16(input)
}

fn u32_be(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

impl Header {
    /// Parse a header; input shorter than the header gives `Err::Incomplete`
    fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, (command, payload_size, data_type, data_count, parameter_1, parameter_2)) =
            (u16_be, u16_be, u16_be, u16_be, u32_be, u32_be).parse(input)?;
        let mut header = Header {
            command,
            payload_size: payload_size as u32,
            data_type,
            data_count: data_count as u32,
            parameter_1,
            parameter_2,
        };
        if payload_size != LARGE_SIZE_SENTINEL {
            return Ok((input, header));
        }
        let (input, (payload_size, data_count)) = (u32_be, u32_be).parse(input)?;
        header.payload_size = payload_size;
        header.data_count = data_count;
        Ok((input, header))
    }

    fn is_large(&self) -> bool {
        self.payload_size >= LARGE_SIZE_SENTINEL as u32
            || self.data_count >= LARGE_SIZE_SENTINEL as u32
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_large() {
            LARGE_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.command.to_be_bytes())?;
        if self.is_large() {
            writer.write_all(&LARGE_SIZE_SENTINEL.to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&0u16.to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
            writer.write_all(&self.payload_size.to_be_bytes())?;
            writer.write_all(&self.data_count.to_be_bytes())?;
        } else {
            writer.write_all(&(self.payload_size as u16).to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&(self.data_count as u16).to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
        }
        Ok(())
    }
}

/// Header fields plus an unpadded payload, ready for writing
#[derive(Debug, Default)]
struct RawMessage {
    command: u16,
    data_type: u16,
    data_count: u32,
    parameter_1: u32,
    parameter_2: u32,
    payload: Vec<u8>,
}

impl RawMessage {
    fn header(&self) -> Header {
        Header {
            command: self.command,
            payload_size: aligned(self.payload.len()) as u32,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.parameter_1,
            parameter_2: self.parameter_2,
        }
    }

    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        let header = self.header();
        header.write(writer)?;
        writer.write_all(&self.payload)?;
        writer.write_all(&[0u8; 8][..header.payload_size as usize - self.payload.len()])?;
        Ok(())
    }
}

/// Round up to the 8-byte message alignment
pub fn aligned(size: usize) -> usize {
    size.div_ceil(8) * 8
}

/// Encode a name as a NUL-terminated payload
fn string_payload(value: &str) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// Read a NUL-terminated (or payload-terminated) string
fn payload_string(payload: &[u8]) -> String {
    let length = payload.iter().position(|&c| c == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..length]).into_owned()
}

fn optional_ip(value: u32, none: u32) -> Option<Ipv4Addr> {
    (value != none).then(|| Ipv4Addr::from(value))
}

fn data_type_field(header: &Header) -> Result<DbrType, DecodeError> {
    DbrType::try_from(header.data_type).map_err(|_| {
        DecodeError::MalformedHeader(format!(
            "command {} has unknown DBR type {}",
            header.command, header.data_type
        ))
    })
}

/// Validate a DBR payload against the type and count declared in its header.
///
/// The payload must hold `count` elements after the metadata, and may only
/// exceed that by alignment padding. Single `DBR_STRING` values may be sent
/// truncated after their terminator.
fn data_payload(
    header: &Header,
    payload: &[u8],
    allow_empty: bool,
) -> Result<(DbrType, Vec<u8>), DecodeError> {
    let data_type = data_type_field(header)?;
    if allow_empty && payload.is_empty() {
        return Ok((data_type, Vec::new()));
    }
    let needed = data_type.payload_size(header.data_count as usize);
    let minimum = if data_type.basic_type == DbrBasicType::String && header.data_count > 0 {
        needed - MAX_STRING_SIZE + 1
    } else {
        needed
    };
    if payload.len() < minimum || payload.len() > aligned(needed) {
        return Err(DecodeError::MalformedHeader(format!(
            "payload of {} bytes does not fit {} x {data_type} ({needed} bytes)",
            payload.len(),
            header.data_count
        )));
    }
    Ok((data_type, payload[..payload.len().min(needed)].to_vec()))
}

/// Severity bits carried in the low three bits of a CA status code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// CA status conditions (`ECA_*`)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ErrorCondition {
    #[default]
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    DblClFail = 18,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    IoDone = 42,
    IoInProgress = 43,
    BadSyncGrp = 44,
    PutCbInProg = 45,
    NoRdAccess = 46,
    NoWtAccess = 47,
    Anachronism = 48,
    NoSearchAddr = 49,
    NoConvert = 50,
    BadChId = 51,
    BadFuncPtr = 52,
    IsAttached = 53,
    UnavailInServ = 54,
    ChanDestroy = 55,
    BadPriority = 56,
    NotThreaded = 57,
    Array16kClient = 58,
    ConnSeqTmo = 59,
    UnrespTmo = 60,
}

impl ErrorCondition {
    const ALL: [ErrorCondition; 34] = [
        Self::Normal,
        Self::AllocMem,
        Self::TooLarge,
        Self::Timeout,
        Self::BadType,
        Self::Internal,
        Self::DblClFail,
        Self::GetFail,
        Self::PutFail,
        Self::BadCount,
        Self::BadStr,
        Self::Disconn,
        Self::EvDisallow,
        Self::BadMonId,
        Self::BadMask,
        Self::IoDone,
        Self::IoInProgress,
        Self::BadSyncGrp,
        Self::PutCbInProg,
        Self::NoRdAccess,
        Self::NoWtAccess,
        Self::Anachronism,
        Self::NoSearchAddr,
        Self::NoConvert,
        Self::BadChId,
        Self::BadFuncPtr,
        Self::IsAttached,
        Self::UnavailInServ,
        Self::ChanDestroy,
        Self::BadPriority,
        Self::NotThreaded,
        Self::Array16kClient,
        Self::ConnSeqTmo,
        Self::UnrespTmo,
    ];

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::IoDone | Self::IoInProgress => ErrorSeverity::Info,
            Self::Internal => ErrorSeverity::Severe,
            Self::BadType
            | Self::BadStr
            | Self::EvDisallow
            | Self::BadMonId
            | Self::BadMask
            | Self::BadSyncGrp
            | Self::PutCbInProg
            | Self::Anachronism
            | Self::BadChId
            | Self::BadFuncPtr
            | Self::BadPriority
            | Self::NotThreaded => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// The status code as sent on the wire
    pub fn status_code(&self) -> u32 {
        ((*self as u32) << 3) | self.severity() as u32
    }

    pub fn from_status_code(code: u32) -> Option<ErrorCondition> {
        let number = code >> 3;
        Self::ALL.into_iter().find(|c| *c as u32 == number)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::TooLarge => {
                "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES"
            }
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::DblClFail => "The requested local DB operation failed",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::EvDisallow => {
                "Request inappropriate within subscription (monitor) update callback"
            }
            Self::BadMonId => "Bad event subscription (monitor) identifier",
            Self::BadMask => "Invalid event selection mask",
            Self::IoDone => "IO operations have completed",
            Self::IoInProgress => "IO operations are in progress",
            Self::BadSyncGrp => "Invalid synchronous group identifier",
            Self::PutCbInProg => "Put callback timed out",
            Self::NoRdAccess => "Read access denied",
            Self::NoWtAccess => "Write access denied",
            Self::Anachronism => "Requested feature is no longer supported",
            Self::NoSearchAddr => "Empty PV search address list",
            Self::NoConvert => "No reasonable data conversion between client and server types",
            Self::BadChId => "Invalid channel identifier",
            Self::BadFuncPtr => "Invalid function pointer",
            Self::IsAttached => "Thread is already attached to a client context",
            Self::UnavailInServ => "Not supported by attached service",
            Self::ChanDestroy => "User destroyed channel",
            Self::BadPriority => "Invalid channel priority",
            Self::NotThreaded => {
                "Preemptive callback not enabled - additional threads may not join context"
            }
            Self::Array16kClient => {
                "Client's protocol revision does not support transfers exceeding 16k bytes"
            }
            Self::ConnSeqTmo => "Virtual circuit connection sequence aborted",
            Self::UnrespTmo => "Virtual circuit unresponsive",
        })
    }
}

impl std::error::Error for ErrorCondition {}

fn status_field(code: u32) -> ErrorCondition {
    ErrorCondition::from_status_code(code).unwrap_or(ErrorCondition::Internal)
}

/// Access rights granted to a client for one channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

impl TryFrom<u32> for Access {
    type Error = DecodeError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Access::None,
            1 => Access::Read,
            2 => Access::Write,
            3 => Access::ReadWrite,
            other => {
                return Err(DecodeError::MalformedHeader(format!(
                    "invalid access rights {other}"
                )));
            }
        })
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::None => "NoAccess",
            Access::Read => "ReadOnly",
            Access::Write => "WriteOnly",
            Access::ReadWrite => "ReadWrite",
        })
    }
}

/// Event selection mask (`DBE_*`) for subscriptions and field logs
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorMask(pub u16);

impl MonitorMask {
    pub const VALUE: MonitorMask = MonitorMask(1);
    /// Archive deadband crossed
    pub const LOG: MonitorMask = MonitorMask(2);
    pub const ALARM: MonitorMask = MonitorMask(4);
    pub const PROPERTY: MonitorMask = MonitorMask(8);

    pub fn intersects(&self, other: MonitorMask) -> bool {
        self.0 & other.0 != 0
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask::VALUE | MonitorMask::ALARM
    }
}

impl BitOr for MonitorMask {
    type Output = MonitorMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        MonitorMask(self.0 | rhs.0)
    }
}

/// CA_PROTO_VERSION.
///
/// The first message on every circuit, in both directions, and the first
/// message of every search datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        }
    }
}

impl Version {
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= CA_MINIMUM_PROTOCOL_REVISION
    }
}

/// CA_PROTO_SEARCH request, normally sent over UDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Whether the server should answer with NOT_FOUND when it lacks the name
    pub should_reply: bool,
    pub protocol_version: u16,
}

impl Search {
    pub fn new(search_id: u32, channel_name: &str) -> Self {
        Search {
            search_id,
            channel_name: channel_name.to_string(),
            should_reply: false,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        }
    }

    /// Bytes this search occupies inside a datagram
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + aligned(self.channel_name.len() + 1)
    }

    pub fn respond(&self, server_ip: Option<Ipv4Addr>, port_number: u16) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version: Some(CA_MINOR_PROTOCOL_REVISION),
        }
    }
}

/// CA_PROTO_SEARCH reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub port_number: u16,
    /// Server to connect to, if different from the datagram sender
    pub server_ip: Option<Ipv4Addr>,
    pub search_id: u32,
    /// Only present in UDP replies
    pub protocol_version: Option<u16>,
}

/// CA_PROTO_NOT_FOUND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub search_id: u32,
    pub protocol_version: u16,
}

/// CA_PROTO_RSRV_IS_UP, the server beacon
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RsrvIsUp {
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: u16,
}

/// CA_PROTO_CREATE_CHAN request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

/// CA_PROTO_CREATE_CHAN reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub data_type: DbrBasicType,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

/// CA_PROTO_CREATE_CH_FAIL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}

/// CA_PROTO_ACCESS_RIGHTS. Sent after channel creation and whenever rights change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}

/// CA_PROTO_CLEAR_CHANNEL, request and confirmation share a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNotify {
    pub data_type: DbrType,
    /// Zero asks for the current native element count
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}

impl ReadNotify {
    pub fn respond(&self, data_count: u32, data: Vec<u8>) -> ReadNotifyResponse {
        ReadNotifyResponse {
            data_type: self.data_type,
            data_count,
            status: ErrorCondition::Normal,
            client_ioid: self.client_ioid,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: ErrorCondition,
    pub client_ioid: u32,
    /// Unpadded DBR payload
    pub data: Vec<u8>,
}

/// CA_PROTO_WRITE, a put without completion notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: ErrorCondition,
    pub client_ioid: u32,
}

/// CA_PROTO_EVENT_ADD subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAdd {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}

/// CA_PROTO_EVENT_ADD update. An empty payload confirms a cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAddResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: ErrorCondition,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCancel {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl EventCancel {
    /// The empty update a server sends to confirm this cancellation
    pub fn confirmation(&self) -> EventAddResponse {
        EventAddResponse {
            data_type: self.data_type,
            data_count: self.data_count,
            status: ErrorCondition::Normal,
            subscription_id: self.subscription_id,
            data: Vec::new(),
        }
    }
}

/// CA_PROTO_ERROR: a request failed. Carries the offending request's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ECAError {
    pub client_id: u32,
    pub condition: ErrorCondition,
    pub original_request: Header,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName {
    pub name: String,
}

/// CA_PROTO_SERVER_DISCONN: the server dropped one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDisconnect {
    pub client_id: u32,
}

/// Every message kind understood by this crate
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(Version),
    Search(Search),
    SearchResponse(SearchResponse),
    NotFound(NotFound),
    RsrvIsUp(RsrvIsUp),
    CreateChannel(CreateChannel),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ClearChannel(ClearChannel),
    ReadNotify(ReadNotify),
    ReadNotifyResponse(ReadNotifyResponse),
    Write(Write),
    WriteNotify(WriteNotify),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAdd(EventAdd),
    EventAddResponse(EventAddResponse),
    EventCancel(EventCancel),
    EventsOff,
    EventsOn,
    ECAError(ECAError),
    Echo,
    ClientName(ClientName),
    HostName(HostName),
    ServerDisconnect(ServerDisconnect),
}

macro_rules! impl_from_message_struct {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(value: $variant) -> Self {
                    Message::$variant(value)
                }
            }
        )*
    };
}

impl_from_message_struct!(
    Version,
    Search,
    SearchResponse,
    NotFound,
    RsrvIsUp,
    CreateChannel,
    CreateChannelResponse,
    CreateChannelFailure,
    AccessRights,
    ClearChannel,
    ReadNotify,
    ReadNotifyResponse,
    Write,
    WriteNotify,
    WriteNotifyResponse,
    EventAdd,
    EventAddResponse,
    EventCancel,
    ECAError,
    ClientName,
    HostName,
    ServerDisconnect,
);

impl Message {
    /// The direction this message travels, or `None` if it is valid both ways
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Message::Version(_) | Message::Echo | Message::ClearChannel(_) => None,
            Message::Search(_)
            | Message::CreateChannel(_)
            | Message::ReadNotify(_)
            | Message::Write(_)
            | Message::WriteNotify(_)
            | Message::EventAdd(_)
            | Message::EventCancel(_)
            | Message::EventsOff
            | Message::EventsOn
            | Message::ClientName(_)
            | Message::HostName(_) => Some(Direction::ToServer),
            _ => Some(Direction::ToClient),
        }
    }

    fn to_raw(&self) -> RawMessage {
        use command::*;
        match self {
            Message::Version(msg) => RawMessage {
                command: VERSION,
                data_type: msg.priority,
                data_count: msg.protocol_version as u32,
                ..Default::default()
            },
            Message::Search(msg) => RawMessage {
                command: SEARCH,
                data_type: if msg.should_reply {
                    SEARCH_DO_REPLY
                } else {
                    SEARCH_DONT_REPLY
                },
                data_count: msg.protocol_version as u32,
                parameter_1: msg.search_id,
                parameter_2: msg.search_id,
                payload: string_payload(&msg.channel_name),
            },
            Message::SearchResponse(msg) => RawMessage {
                command: SEARCH,
                data_type: msg.port_number,
                data_count: 0,
                parameter_1: msg.server_ip.map_or(u32::MAX, u32::from),
                parameter_2: msg.search_id,
                payload: msg
                    .protocol_version
                    .map(|v| v.to_be_bytes().to_vec())
                    .unwrap_or_default(),
            },
            Message::NotFound(msg) => RawMessage {
                command: NOT_FOUND,
                data_type: SEARCH_DO_REPLY,
                data_count: msg.protocol_version as u32,
                parameter_1: msg.search_id,
                parameter_2: msg.search_id,
                ..Default::default()
            },
            Message::RsrvIsUp(msg) => RawMessage {
                command: RSRV_IS_UP,
                data_type: msg.protocol_version,
                data_count: msg.server_port as u32,
                parameter_1: msg.beacon_id,
                parameter_2: msg.server_ip.map_or(0, u32::from),
                ..Default::default()
            },
            Message::CreateChannel(msg) => RawMessage {
                command: CREATE_CHAN,
                parameter_1: msg.client_id,
                parameter_2: msg.protocol_version,
                payload: string_payload(&msg.channel_name),
                ..Default::default()
            },
            Message::CreateChannelResponse(msg) => RawMessage {
                command: CREATE_CHAN,
                data_type: msg.data_type as u16,
                data_count: msg.data_count,
                parameter_1: msg.client_id,
                parameter_2: msg.server_id,
                ..Default::default()
            },
            Message::CreateChannelFailure(msg) => RawMessage {
                command: CREATE_CH_FAIL,
                parameter_1: msg.client_id,
                ..Default::default()
            },
            Message::AccessRights(msg) => RawMessage {
                command: ACCESS_RIGHTS,
                parameter_1: msg.client_id,
                parameter_2: msg.access_rights as u32,
                ..Default::default()
            },
            Message::ClearChannel(msg) => RawMessage {
                command: CLEAR_CHANNEL,
                parameter_1: msg.server_id,
                parameter_2: msg.client_id,
                ..Default::default()
            },
            Message::ReadNotify(msg) => RawMessage {
                command: READ_NOTIFY,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.server_id,
                parameter_2: msg.client_ioid,
                ..Default::default()
            },
            Message::ReadNotifyResponse(msg) => RawMessage {
                command: READ_NOTIFY,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.status.status_code(),
                parameter_2: msg.client_ioid,
                payload: msg.data.clone(),
            },
            Message::Write(msg) => RawMessage {
                command: WRITE,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.server_id,
                parameter_2: msg.client_ioid,
                payload: msg.data.clone(),
            },
            Message::WriteNotify(msg) => RawMessage {
                command: WRITE_NOTIFY,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.server_id,
                parameter_2: msg.client_ioid,
                payload: msg.data.clone(),
            },
            Message::WriteNotifyResponse(msg) => RawMessage {
                command: WRITE_NOTIFY,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.status.status_code(),
                parameter_2: msg.client_ioid,
                ..Default::default()
            },
            Message::EventAdd(msg) => {
                // Low, high and timeout floats are unused since 3.13
                let mut payload = vec![0u8; 12];
                payload.extend(msg.mask.0.to_be_bytes());
                payload.extend([0u8; 2]);
                RawMessage {
                    command: EVENT_ADD,
                    data_type: msg.data_type.into(),
                    data_count: msg.data_count,
                    parameter_1: msg.server_id,
                    parameter_2: msg.subscription_id,
                    payload,
                }
            }
            Message::EventAddResponse(msg) => RawMessage {
                command: EVENT_ADD,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.status.status_code(),
                parameter_2: msg.subscription_id,
                payload: msg.data.clone(),
            },
            Message::EventCancel(msg) => RawMessage {
                command: EVENT_CANCEL,
                data_type: msg.data_type.into(),
                data_count: msg.data_count,
                parameter_1: msg.server_id,
                parameter_2: msg.subscription_id,
                ..Default::default()
            },
            Message::EventsOff => RawMessage {
                command: EVENTS_OFF,
                ..Default::default()
            },
            Message::EventsOn => RawMessage {
                command: EVENTS_ON,
                ..Default::default()
            },
            Message::ECAError(msg) => {
                let mut payload = Vec::new();
                // Writing into a Vec cannot fail
                let _ = msg.original_request.write(&mut payload);
                payload.extend(string_payload(&msg.error_message));
                RawMessage {
                    command: ERROR,
                    parameter_1: msg.client_id,
                    parameter_2: msg.condition.status_code(),
                    payload,
                    ..Default::default()
                }
            }
            Message::Echo => RawMessage {
                command: ECHO,
                ..Default::default()
            },
            Message::ClientName(msg) => RawMessage {
                command: CLIENT_NAME,
                payload: string_payload(&msg.name),
                ..Default::default()
            },
            Message::HostName(msg) => RawMessage {
                command: HOST_NAME,
                payload: string_payload(&msg.name),
                ..Default::default()
            },
            Message::ServerDisconnect(msg) => RawMessage {
                command: SERVER_DISCONN,
                parameter_1: msg.client_id,
                ..Default::default()
            },
        }
    }

    pub fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }

    /// The header this message is sent with, as echoed back in CA_PROTO_ERROR
    pub fn header(&self) -> Header {
        self.to_raw().header()
    }

    /// Encode to wire bytes, padding included
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        // Writing into a Vec cannot fail
        let _ = self.write(&mut buffer);
        buffer.into_inner()
    }

    /// Encode a sequence of messages into one buffer
    pub fn encode_all<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Vec<u8> {
        let mut buffer = Vec::new();
        for message in messages {
            let _ = message.write(&mut buffer);
        }
        buffer
    }

    /// Decode one message from the front of `input`.
    ///
    /// Returns the number of bytes consumed along with the message.
    pub fn decode(input: &[u8], direction: Direction) -> Result<(usize, Message), DecodeError> {
        Self::decode_with_limit(input, direction, usize::MAX)
    }

    /// As [`Message::decode`], refusing payloads larger than `max_payload`
    pub fn decode_with_limit(
        input: &[u8],
        direction: Direction,
        max_payload: usize,
    ) -> Result<(usize, Message), DecodeError> {
        let (header_length, header) = match Header::parse(input) {
            Ok((rest, header)) => (input.len() - rest.len(), header),
            Err(nom::Err::Incomplete(_)) => {
                let is_large = input.len() >= 4 && input[2..4] == LARGE_SIZE_SENTINEL.to_be_bytes();
                let wanted = if is_large { LARGE_HEADER_SIZE } else { HEADER_SIZE };
                return Err(DecodeError::ShortRead {
                    needed: wanted - input.len(),
                });
            }
            Err(e) => return Err(DecodeError::MalformedHeader(format!("{e:?}"))),
        };
        let payload_size = header.payload_size as usize;
        if payload_size > max_payload {
            return Err(DecodeError::TooLarge {
                size: payload_size,
                limit: max_payload,
            });
        }
        let total = header_length + payload_size;
        if !is_known_command(header.command, direction) {
            return Err(DecodeError::UnknownCommand {
                command: header.command,
                length: total,
            });
        }
        if input.len() < total {
            return Err(DecodeError::ShortRead {
                needed: total - input.len(),
            });
        }
        let message = Self::from_parts(&header, &input[header_length..total], direction)?;
        Ok((total, message))
    }

    /// Decode every message in a datagram, skipping unknown commands
    pub fn decode_datagram(input: &[u8], direction: Direction) -> Result<Vec<Message>, DecodeError> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < input.len() {
            match Self::decode(&input[offset..], direction) {
                Ok((used, message)) => {
                    offset += used;
                    messages.push(message);
                }
                Err(DecodeError::UnknownCommand { command, length })
                    if offset + length <= input.len() =>
                {
                    debug!("Skipping unknown command {command} in datagram");
                    offset += length;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(messages)
    }

    fn from_parts(
        header: &Header,
        payload: &[u8],
        direction: Direction,
    ) -> Result<Message, DecodeError> {
        use Direction::*;
        use command::*;
        Ok(match (header.command, direction) {
            (VERSION, _) => Message::Version(Version {
                priority: header.data_type,
                protocol_version: header.data_count as u16,
            }),
            (SEARCH, ToServer) => Message::Search(Search {
                search_id: header.parameter_1,
                channel_name: payload_string(payload),
                should_reply: header.data_type == SEARCH_DO_REPLY,
                protocol_version: header.data_count as u16,
            }),
            (SEARCH, ToClient) => Message::SearchResponse(SearchResponse {
                port_number: header.data_type,
                server_ip: optional_ip(header.parameter_1, u32::MAX),
                search_id: header.parameter_2,
                protocol_version: (payload.len() >= 2)
                    .then(|| u16::from_be_bytes([payload[0], payload[1]])),
            }),
            (NOT_FOUND, ToClient) => Message::NotFound(NotFound {
                search_id: header.parameter_1,
                protocol_version: header.data_count as u16,
            }),
            (RSRV_IS_UP, ToClient) => Message::RsrvIsUp(RsrvIsUp {
                server_port: header.data_count as u16,
                beacon_id: header.parameter_1,
                server_ip: optional_ip(header.parameter_2, 0),
                protocol_version: header.data_type,
            }),
            (CREATE_CHAN, ToServer) => Message::CreateChannel(CreateChannel {
                client_id: header.parameter_1,
                protocol_version: header.parameter_2,
                channel_name: payload_string(payload),
            }),
            (CREATE_CHAN, ToClient) => Message::CreateChannelResponse(CreateChannelResponse {
                data_type: DbrBasicType::try_from(header.data_type).map_err(|_| {
                    DecodeError::MalformedHeader(format!(
                        "channel has unknown native type {}",
                        header.data_type
                    ))
                })?,
                data_count: header.data_count,
                client_id: header.parameter_1,
                server_id: header.parameter_2,
            }),
            (CREATE_CH_FAIL, ToClient) => Message::CreateChannelFailure(CreateChannelFailure {
                client_id: header.parameter_1,
            }),
            (ACCESS_RIGHTS, ToClient) => Message::AccessRights(AccessRights {
                client_id: header.parameter_1,
                access_rights: header.parameter_2.try_into()?,
            }),
            (CLEAR_CHANNEL, _) => Message::ClearChannel(ClearChannel {
                server_id: header.parameter_1,
                client_id: header.parameter_2,
            }),
            (READ_NOTIFY, ToServer) => Message::ReadNotify(ReadNotify {
                data_type: data_type_field(header)?,
                data_count: header.data_count,
                server_id: header.parameter_1,
                client_ioid: header.parameter_2,
            }),
            (READ_NOTIFY, ToClient) => {
                let (data_type, data) = data_payload(header, payload, true)?;
                Message::ReadNotifyResponse(ReadNotifyResponse {
                    data_type,
                    data_count: header.data_count,
                    status: status_field(header.parameter_1),
                    client_ioid: header.parameter_2,
                    data,
                })
            }
            (WRITE, ToServer) => {
                let (data_type, data) = data_payload(header, payload, false)?;
                Message::Write(Write {
                    data_type,
                    data_count: header.data_count,
                    server_id: header.parameter_1,
                    client_ioid: header.parameter_2,
                    data,
                })
            }
            (WRITE_NOTIFY, ToServer) => {
                let (data_type, data) = data_payload(header, payload, false)?;
                Message::WriteNotify(WriteNotify {
                    data_type,
                    data_count: header.data_count,
                    server_id: header.parameter_1,
                    client_ioid: header.parameter_2,
                    data,
                })
            }
            (WRITE_NOTIFY, ToClient) => Message::WriteNotifyResponse(WriteNotifyResponse {
                data_type: data_type_field(header)?,
                data_count: header.data_count,
                status: status_field(header.parameter_1),
                client_ioid: header.parameter_2,
            }),
            (EVENT_ADD, ToServer) => Message::EventAdd(EventAdd {
                data_type: data_type_field(header)?,
                data_count: header.data_count,
                server_id: header.parameter_1,
                subscription_id: header.parameter_2,
                mask: match payload.get(12..14) {
                    Some(mask) => MonitorMask(u16::from_be_bytes([mask[0], mask[1]])),
                    None => MonitorMask::default(),
                },
            }),
            (EVENT_ADD, ToClient) => {
                let (data_type, data) = data_payload(header, payload, true)?;
                Message::EventAddResponse(EventAddResponse {
                    data_type,
                    data_count: header.data_count,
                    status: status_field(header.parameter_1),
                    subscription_id: header.parameter_2,
                    data,
                })
            }
            (EVENT_CANCEL, ToServer) => Message::EventCancel(EventCancel {
                data_type: data_type_field(header)?,
                data_count: header.data_count,
                server_id: header.parameter_1,
                subscription_id: header.parameter_2,
            }),
            (EVENTS_OFF, ToServer) => Message::EventsOff,
            (EVENTS_ON, ToServer) => Message::EventsOn,
            (ERROR, ToClient) => {
                let (rest, original_request) = Header::parse(payload).map_err(|_| {
                    DecodeError::MalformedHeader("error message lacks original header".into())
                })?;
                Message::ECAError(ECAError {
                    client_id: header.parameter_1,
                    condition: status_field(header.parameter_2),
                    original_request,
                    error_message: payload_string(rest),
                })
            }
            (ECHO, _) => Message::Echo,
            (CLIENT_NAME, ToServer) => Message::ClientName(ClientName {
                name: payload_string(payload),
            }),
            (HOST_NAME, ToServer) => Message::HostName(HostName {
                name: payload_string(payload),
            }),
            (SERVER_DISCONN, ToClient) => Message::ServerDisconnect(ServerDisconnect {
                client_id: header.parameter_1,
            }),
            (command, _) => {
                return Err(DecodeError::UnknownCommand {
                    command,
                    length: header.encoded_len() + payload.len(),
                });
            }
        })
    }
}

fn is_known_command(command: u16, direction: Direction) -> bool {
    use command::*;
    match direction {
        Direction::ToServer => matches!(
            command,
            VERSION
                | EVENT_ADD
                | EVENT_CANCEL
                | WRITE
                | SEARCH
                | EVENTS_OFF
                | EVENTS_ON
                | CLEAR_CHANNEL
                | READ_NOTIFY
                | CREATE_CHAN
                | WRITE_NOTIFY
                | CLIENT_NAME
                | HOST_NAME
                | ECHO
        ),
        Direction::ToClient => matches!(
            command,
            VERSION
                | EVENT_ADD
                | SEARCH
                | ERROR
                | CLEAR_CHANNEL
                | RSRV_IS_UP
                | NOT_FOUND
                | READ_NOTIFY
                | CREATE_CHAN
                | WRITE_NOTIFY
                | ACCESS_RIGHTS
                | ECHO
                | CREATE_CH_FAIL
                | SERVER_DISCONN
        ),
    }
}

/// Stream framing for circuits.
///
/// Partial messages stay buffered until complete; unknown commands are skipped;
/// anything else that fails to decode ends the stream.
#[derive(Debug, Clone)]
pub struct CaCodec {
    direction: Direction,
    max_payload: usize,
}

impl CaCodec {
    /// A codec reading messages travelling in `direction`
    pub fn new(direction: Direction) -> Self {
        CaCodec {
            direction,
            max_payload: usize::MAX,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Decoder for CaCodec {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match Message::decode_with_limit(src, self.direction, self.max_payload) {
                Ok((used, message)) => {
                    src.advance(used);
                    return Ok(Some(message));
                }
                Err(DecodeError::ShortRead { needed }) => {
                    src.reserve(needed);
                    return Ok(None);
                }
                Err(DecodeError::UnknownCommand { command, length }) => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    warn!("Skipping message with unknown command {command} ({length} bytes)");
                    src.advance(length);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Encoder<Message> for CaCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::DbrCategory;

    fn decode_as(bytes: &[u8], direction: Direction) -> Message {
        let (used, message) = Message::decode(bytes, direction).unwrap();
        assert_eq!(used, bytes.len());
        message
    }

    #[test]
    fn parse_beacon() {
        let raw = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let Message::RsrvIsUp(beacon) = decode_as(raw, Direction::ToClient) else {
            panic!("Not a beacon");
        };
        assert_eq!(beacon.server_port, 37426);
        assert_eq!(beacon.beacon_id, 450270);
        assert_eq!(beacon.server_ip, Some(Ipv4Addr::new(172, 23, 124, 207)));
        assert_eq!(Message::RsrvIsUp(beacon).encode(), raw);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let Message::Version(version) = decode_as(raw, Direction::ToServer) else {
            panic!("Not a version");
        };
        assert_eq!(version.priority, 1);
        assert_eq!(version.protocol_version, 13);
        assert_eq!(Message::Version(version).encode(), raw);
    }

    #[test]
    fn parse_search_datagram() {
        let raw = [
            0x0u8, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0xd, 0x0, 0x0, 0x0, 0x5, 0x0, 0x0, 0x0, 0x0,
            0x0u8, 0x6, 0x0, 0x8, 0x0, 0x5, 0x0, 0xd, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1, 0x73,
            0x6f, 0x6d, 0x65, 0x0, 0x0, 0x0, 0x0,
        ];
        let messages = Message::decode_datagram(&raw, Direction::ToServer).unwrap();
        assert_eq!(messages.len(), 2);
        let Message::Search(search) = &messages[1] else {
            panic!("Expected a search");
        };
        assert_eq!(search.channel_name, "some");
        assert_eq!(search.search_id, 1);
        assert!(!search.should_reply);
    }

    #[test]
    fn search_response_direction() {
        let search = Search::new(7, "TEST:PV");
        let reply = Message::SearchResponse(search.respond(None, 5064));
        let bytes = reply.encode();
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode_as(&bytes, Direction::ToClient), reply);
        // The same bytes read as a request are a search with an empty name
        assert!(matches!(
            decode_as(&bytes, Direction::ToServer),
            Message::Search(_)
        ));
    }

    #[test]
    fn large_header_is_used_for_big_counts() {
        let message = Message::ReadNotify(ReadNotify {
            data_type: DbrType::new(DbrBasicType::Char, DbrCategory::Basic),
            data_count: 0x10000,
            server_id: 3,
            client_ioid: 4,
        });
        let bytes = message.encode();
        assert_eq!(bytes.len(), LARGE_HEADER_SIZE);
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(decode_as(&bytes, Direction::ToServer), message);
    }

    #[test]
    fn payloads_are_padded() {
        let bytes = Message::ClientName(ClientName {
            name: "operator".into(),
        })
        .encode();
        // eight characters plus terminator pads to sixteen
        assert_eq!(bytes.len(), HEADER_SIZE + 16);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 16);
    }

    #[test]
    fn short_reads_report_missing_bytes() {
        let bytes = Message::Search(Search::new(1, "A:LONGER:NAME")).encode();
        for length in 0..bytes.len() {
            match Message::decode(&bytes[..length], Direction::ToServer) {
                Err(DecodeError::ShortRead { needed }) => {
                    assert!(needed > 0 && length + needed <= bytes.len())
                }
                other => panic!("prefix {length} gave {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_commands_are_soft_errors() {
        let mut bytes = vec![0x00, 0x63, 0x00, 0x08];
        bytes.extend([0u8; 12]);
        bytes.extend([1u8; 8]);
        match Message::decode(&bytes, Direction::ToClient) {
            Err(DecodeError::UnknownCommand { command: 99, length }) => assert_eq!(length, 24),
            other => panic!("{other:?}"),
        }
        // Followed by a real message, the codec skips over it
        bytes.extend(Message::Echo.encode());
        let mut buffer = BytesMut::from(&bytes[..]);
        let mut codec = CaCodec::new(Direction::ToClient);
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Message::Echo));
        assert!(buffer.is_empty());
    }

    #[test]
    fn inconsistent_payload_is_malformed() {
        // DBR_DOUBLE x 1 with a 12 byte payload
        let mut bytes = vec![0x00, 0x0F, 0x00, 0x0C, 0x00, 0x06, 0x00, 0x01];
        bytes.extend(ErrorCondition::Normal.status_code().to_be_bytes());
        bytes.extend(5u32.to_be_bytes());
        bytes.extend([0u8; 12]);
        assert!(matches!(
            Message::decode(&bytes, Direction::ToClient),
            Err(DecodeError::MalformedHeader(_))
        ));
        // And one too short for its count
        let message = Message::ReadNotifyResponse(ReadNotifyResponse {
            data_type: DbrType::new(DbrBasicType::Long, DbrCategory::Basic),
            data_count: 3,
            status: ErrorCondition::Normal,
            client_ioid: 1,
            data: vec![0u8; 8],
        });
        assert!(matches!(
            Message::decode(&message.encode(), Direction::ToClient),
            Err(DecodeError::MalformedHeader(_))
        ));
    }

    #[test]
    fn short_single_strings_are_accepted() {
        let message = Message::Write(Write {
            data_type: DbrType::new(DbrBasicType::String, DbrCategory::Basic),
            data_count: 1,
            server_id: 1,
            client_ioid: 2,
            data: b"abc\0\0\0\0\0".to_vec(),
        });
        assert_eq!(decode_as(&message.encode(), Direction::ToServer), message);
    }

    #[test]
    fn too_large_payloads_are_refused() {
        let message = Message::Write(Write {
            data_type: DbrType::new(DbrBasicType::Char, DbrCategory::Basic),
            data_count: 64,
            server_id: 1,
            client_ioid: 2,
            data: vec![1u8; 64],
        });
        assert!(matches!(
            Message::decode_with_limit(&message.encode(), Direction::ToServer, 32),
            Err(DecodeError::TooLarge { size: 64, limit: 32 })
        ));
    }

    #[test]
    fn error_message_carries_original_header() {
        let request = Message::ReadNotify(ReadNotify {
            data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Time),
            data_count: 1,
            server_id: 9,
            client_ioid: 12,
        });
        let (_, original) = Header::parse(&request.encode()).unwrap();
        assert_eq!(request.header(), original);
        let error = Message::ECAError(ECAError {
            client_id: 4,
            condition: ErrorCondition::NoRdAccess,
            original_request: original,
            error_message: "TEST:PV".into(),
        });
        let decoded = decode_as(&error.encode(), Direction::ToClient);
        assert_eq!(decoded, error);
        let Message::ECAError(decoded) = decoded else {
            unreachable!()
        };
        assert_eq!(decoded.original_request.parameter_2, 12);
    }

    #[test]
    fn status_codes() {
        assert_eq!(ErrorCondition::Normal.status_code(), 1);
        assert_eq!(ErrorCondition::Disconn.status_code(), 192);
        assert_eq!(ErrorCondition::from_status_code(1), Some(ErrorCondition::Normal));
        for condition in ErrorCondition::ALL {
            assert_eq!(
                ErrorCondition::from_status_code(condition.status_code()),
                Some(condition)
            );
        }
    }
}
