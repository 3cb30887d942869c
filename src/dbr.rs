//! CA "DBR" payload representations.
//!
//! Every data-bearing CA message carries a DBR type code in its header. The code
//! combines one of seven basic value types ([`DbrBasicType`]) with one of five
//! metadata categories ([`DbrCategory`]); `code = category * 7 + basic_type`. The
//! special `DBR_CLASS_NAME` (38) returns the record type as a string.
//!
//! The payload layout is always `metadata, alignment padding, values`. The codec
//! uses [`DbrType::metadata_size`] and [`DbrBasicType::element_size`] to check
//! that a declared payload length is consistent with its declared type and count
//! before anything downstream looks at the bytes.
//!
//! Values are carried in [`DbrValue`]; a value with its metadata is a [`Dbr`].
//! Graphics and control metadata (units, limits, enum strings) is transported as
//! opaque bytes: it is preserved between peers but not interpreted here.
//!
//! See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nom::{
    IResult, Parser,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::NumCast;
use thiserror::Error;

use crate::messages::ErrorCondition;

/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
pub const EPICS_EPOCH_OFFSET: u64 = 631_152_000;
/// Fixed size of a `DBR_STRING` element, including the terminator
pub const MAX_STRING_SIZE: usize = 40;

/// Basic DBR value types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrBasicType {
    /// Size of one element of this type on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Int => 2,
            DbrBasicType::Float => 4,
            DbrBasicType::Enum => 2,
            DbrBasicType::Char => 1,
            DbrBasicType::Long => 4,
            DbrBasicType::Double => 8,
        }
    }
}

impl TryFrom<u16> for DbrBasicType {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::String,
            1 => Self::Int,
            2 => Self::Float,
            3 => Self::Enum,
            4 => Self::Char,
            5 => Self::Long,
            6 => Self::Double,
            other => return Err(DbrError::UnknownType(other)),
        })
    }
}

impl Display for DbrBasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "SHORT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        })
    }
}

/// Metadata categories that can accompany a value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    /// The single-valued `DBR_CLASS_NAME`
    ClassName = 8,
}

/// A complete `DBR_<CATEGORY>_<TYPE>` code
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_CLASS_NAME: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::ClassName,
};

impl DbrType {
    pub const fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Number of bytes preceding the first value element, including padding
    ///
    /// This is the offset of `value` inside the matching `struct dbr_*` in
    /// `db_access.h`.
    pub fn metadata_size(&self) -> usize {
        use DbrBasicType as B;
        use DbrCategory as C;
        match (self.category, self.basic_type) {
            (C::Basic | C::ClassName, _) => 0,
            // Strings never carry graphic or control information
            (C::Status | C::Graphics | C::Control, B::String) => 4,
            (C::Status, B::Char) => 5,
            (C::Status, B::Double) => 8,
            (C::Status, _) => 4,
            (C::Time, B::Int | B::Enum) => 14,
            (C::Time, B::Char) => 15,
            (C::Time, B::Double) => 16,
            (C::Time, _) => 12,
            (C::Graphics | C::Control, B::Enum) => 422,
            (C::Graphics, B::Int) => 24,
            (C::Graphics, B::Float) => 40,
            (C::Graphics, B::Char) => 19,
            (C::Graphics, B::Long) => 36,
            (C::Graphics, B::Double) => 64,
            (C::Control, B::Int) => 28,
            (C::Control, B::Float) => 48,
            (C::Control, B::Char) => 21,
            (C::Control, B::Long) => 44,
            (C::Control, B::Double) => 80,
        }
    }

    /// Unpadded payload size for `count` elements of this type
    pub fn payload_size(&self, count: usize) -> usize {
        self.metadata_size() + count * self.basic_type.element_size()
    }
}

impl TryFrom<u16> for DbrType {
    type Error = DbrError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let category = match value / 7 {
            _ if value == 38 => return Ok(DBR_CLASS_NAME),
            0 => DbrCategory::Basic,
            1 => DbrCategory::Status,
            2 => DbrCategory::Time,
            3 => DbrCategory::Graphics,
            4 => DbrCategory::Control,
            _ => return Err(DbrError::UnknownType(value)),
        };
        Ok(DbrType {
            basic_type: (value % 7).try_into()?,
            category,
        })
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value.category {
            DbrCategory::ClassName => 38,
            category => category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            DbrCategory::ClassName => f.write_str("DBR_CLASS_NAME"),
            DbrCategory::Basic => write!(f, "DBR_{}", self.basic_type),
            DbrCategory::Status => write!(f, "DBR_STS_{}", self.basic_type),
            DbrCategory::Time => write!(f, "DBR_TIME_{}", self.basic_type),
            DbrCategory::Graphics => write!(f, "DBR_GR_{}", self.basic_type),
            DbrCategory::Control => write!(f, "DBR_CTRL_{}", self.basic_type),
        }
    }
}

impl FromStr for DbrType {
    type Err = DbrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let name = upper.strip_prefix("DBR_").unwrap_or(&upper);
        if name == "CLASS_NAME" {
            return Ok(DBR_CLASS_NAME);
        }
        let (category, kind) = match name.split_once('_') {
            Some(("STS", kind)) => (DbrCategory::Status, kind),
            Some(("TIME", kind)) => (DbrCategory::Time, kind),
            Some(("GR", kind)) => (DbrCategory::Graphics, kind),
            Some(("CTRL", kind)) => (DbrCategory::Control, kind),
            Some(_) => return Err(DbrError::UnknownName(s.to_string())),
            None => (DbrCategory::Basic, name),
        };
        let basic_type = match kind {
            "STRING" => DbrBasicType::String,
            "INT" | "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Char,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(DbrError::UnknownName(s.to_string())),
        };
        Ok(DbrType::new(basic_type, category))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbrError {
    #[error("Unknown DBR type code {0}")]
    UnknownType(u16),
    #[error("Unknown DBR type name '{0}'")]
    UnknownName(String),
    #[error("Payload of {actual} bytes is too short: {dbr_type} x {count} needs {needed}")]
    Truncated {
        dbr_type: DbrType,
        count: usize,
        needed: usize,
        actual: usize,
    },
}

/// Values carried by a DBR
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(Vec<u16>),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Encode a string into at most `max_length - 1` bytes without splitting a character
fn truncate_to_bytes(value: &str, max_length: usize) -> &str {
    let mut end = 0;
    for (index, c) in value.char_indices() {
        if index + c.len_utf8() >= max_length {
            break;
        }
        end = index + c.len_utf8();
    }
    &value[..end]
}

/// Read a NUL-terminated string out of a fixed-size field
fn fixed_string(field: &[u8]) -> String {
    let length = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..length]).into_owned()
}

fn convert_numbers<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
where
    T: Copy + NumCast,
    U: NumCast,
{
    from.iter()
        .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
        .collect()
}

fn parse_strings<U: FromStr>(from: &[String]) -> Result<Vec<U>, ErrorCondition> {
    from.iter()
        .map(|s| s.trim().parse().map_err(|_| ErrorCondition::NoConvert))
        .collect()
}

fn format_numbers<T: Display>(from: &[T]) -> Vec<String> {
    from.iter().map(|v| v.to_string()).collect()
}

/// Expands to the same expression for every numeric variant of a [`DbrValue`]
macro_rules! each_numeric {
    ($value:expr, $bind:ident => $body:expr, $other:pat => $fallback:expr) => {
        match $value {
            DbrValue::Enum($bind) => $body,
            DbrValue::Char($bind) => $body,
            DbrValue::Int($bind) => $body,
            DbrValue::Long($bind) => $body,
            DbrValue::Float($bind) => $body,
            DbrValue::Double($bind) => $body,
            $other => $fallback,
        }
    };
}

impl DbrValue {
    pub fn count(&self) -> usize {
        each_numeric!(self, v => v.len(), DbrValue::String(v) => v.len())
    }

    pub fn basic_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// First element as a float, for filters that compare magnitudes
    pub fn first_as_f64(&self) -> Option<f64> {
        each_numeric!(self, v => v.first().and_then(|n| NumCast::from(*n)),
            DbrValue::String(v) => v.first().and_then(|s| s.trim().parse().ok()))
    }

    /// Convert to another basic type.
    ///
    /// Numeric conversions fail with [`ErrorCondition::NoConvert`] when a value is
    /// not representable in the target type. Strings convert to `CHAR` as raw
    /// bytes and to the other numeric types by parsing.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        if self.basic_type() == basic_type {
            return Ok(self.clone());
        }
        Ok(match (basic_type, self) {
            (DbrBasicType::String, DbrValue::Char(chars)) => {
                let bytes: Vec<u8> = chars.iter().map(|c| *c as u8).collect();
                DbrValue::String(vec![fixed_string(&bytes)])
            }
            (DbrBasicType::String, numeric) => DbrValue::String(
                each_numeric!(numeric, v => format_numbers(v), _ => unreachable!()),
            ),
            (DbrBasicType::Char, DbrValue::String(strings)) => match strings.as_slice() {
                [] => DbrValue::Char(Vec::new()),
                [single] => DbrValue::Char(single.bytes().map(|b| b as i8).collect()),
                _ => return Err(ErrorCondition::NoConvert),
            },
            (DbrBasicType::Char, v) => {
                DbrValue::Char(each_numeric!(v, n => convert_numbers(n)?, DbrValue::String(_) => unreachable!()))
            }
            (DbrBasicType::Int, DbrValue::String(s)) => DbrValue::Int(parse_strings(s)?),
            (DbrBasicType::Int, v) => {
                DbrValue::Int(each_numeric!(v, n => convert_numbers(n)?, DbrValue::String(_) => unreachable!()))
            }
            (DbrBasicType::Long, DbrValue::String(s)) => DbrValue::Long(parse_strings(s)?),
            (DbrBasicType::Long, v) => {
                DbrValue::Long(each_numeric!(v, n => convert_numbers(n)?, DbrValue::String(_) => unreachable!()))
            }
            (DbrBasicType::Float, DbrValue::String(s)) => DbrValue::Float(parse_strings(s)?),
            (DbrBasicType::Float, v) => {
                DbrValue::Float(each_numeric!(v, n => convert_numbers(n)?, DbrValue::String(_) => unreachable!()))
            }
            (DbrBasicType::Double, DbrValue::String(s)) => DbrValue::Double(parse_strings(s)?),
            (DbrBasicType::Double, v) => {
                DbrValue::Double(each_numeric!(v, n => convert_numbers(n)?, DbrValue::String(_) => unreachable!()))
            }
            (DbrBasicType::Enum, DbrValue::String(s)) => DbrValue::Enum(parse_strings(s)?),
            (DbrBasicType::Enum, v) => {
                DbrValue::Enum(each_numeric!(v, n => convert_numbers(n)?, DbrValue::String(_) => unreachable!()))
            }
        })
    }

    /// Encode up to `max_elements` values, returning the count actually written
    pub fn encode(&self, max_elements: Option<usize>) -> (usize, Vec<u8>) {
        let elements = max_elements.map_or(self.count(), |m| m.min(self.count()));
        let mut out = Vec::with_capacity(elements * self.basic_type().element_size());
        match self {
            DbrValue::String(values) => {
                for value in values.iter().take(elements) {
                    let start = out.len();
                    out.extend_from_slice(truncate_to_bytes(value, MAX_STRING_SIZE).as_bytes());
                    out.resize(start + MAX_STRING_SIZE, 0);
                }
            }
            DbrValue::Enum(v) => v.iter().take(elements).for_each(|n| out.extend(n.to_be_bytes())),
            DbrValue::Char(v) => v.iter().take(elements).for_each(|n| out.extend(n.to_be_bytes())),
            DbrValue::Int(v) => v.iter().take(elements).for_each(|n| out.extend(n.to_be_bytes())),
            DbrValue::Long(v) => v.iter().take(elements).for_each(|n| out.extend(n.to_be_bytes())),
            DbrValue::Float(v) => v.iter().take(elements).for_each(|n| out.extend(n.to_be_bytes())),
            DbrValue::Double(v) => v.iter().take(elements).for_each(|n| out.extend(n.to_be_bytes())),
        }
        (elements, out)
    }

    /// Decode `item_count` values. `data` must hold at least that many elements.
    fn decode(basic_type: DbrBasicType, item_count: usize, data: &[u8]) -> IResult<&[u8], Self> {
        Ok(match basic_type {
            DbrBasicType::String => {
                let (rest, fields) =
                    count(nom::bytes::complete::take(MAX_STRING_SIZE), item_count).parse(data)?;
                (
                    rest,
                    DbrValue::String(fields.into_iter().map(fixed_string).collect()),
                )
            }
            DbrBasicType::Enum => {
                let (rest, v) = count(be_u16, item_count).parse(data)?;
                (rest, DbrValue::Enum(v))
            }
            DbrBasicType::Char => {
                let (rest, v) = count(be_i8, item_count).parse(data)?;
                (rest, DbrValue::Char(v))
            }
            DbrBasicType::Int => {
                let (rest, v) = count(be_i16, item_count).parse(data)?;
                (rest, DbrValue::Int(v))
            }
            DbrBasicType::Long => {
                let (rest, v) = count(be_i32, item_count).parse(data)?;
                (rest, DbrValue::Long(v))
            }
            DbrBasicType::Float => {
                let (rest, v) = count(be_f32, item_count).parse(data)?;
                (rest, DbrValue::Float(v))
            }
            DbrBasicType::Double => {
                let (rest, v) = count(be_f64, item_count).parse(data)?;
                (rest, DbrValue::Double(v))
            }
        })
    }

    /// Grow or shrink to exactly `size` elements
    pub fn resize(&mut self, size: usize) {
        match self {
            DbrValue::Enum(v) => v.resize(size, 0),
            DbrValue::String(v) => v.resize(size, String::new()),
            DbrValue::Char(v) => v.resize(size, 0),
            DbrValue::Int(v) => v.resize(size, 0),
            DbrValue::Long(v) => v.resize(size, 0),
            DbrValue::Float(v) => v.resize(size, 0.0),
            DbrValue::Double(v) => v.resize(size, 0.0),
        }
    }
}

impl Display for DbrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = match self {
            DbrValue::String(v) => v.clone(),
            numeric => each_numeric!(numeric, v => format_numbers(v), _ => unreachable!()),
        };
        write!(f, "{}", parts.join(" "))
    }
}

macro_rules! impl_value_conversions {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl TryFrom<DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
        impl TryFrom<DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or(ErrorCondition::BadCount)
            }
        }
    };
}
impl_value_conversions!(Char, i8);
impl_value_conversions!(Int, i16);
impl_value_conversions!(Long, i32);
impl_value_conversions!(Float, f32);
impl_value_conversions!(Double, f64);
impl_value_conversions!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}

/// Alarm status and severity
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// A value together with the metadata of its category
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    Basic(DbrValue),
    Status {
        status: Status,
        value: DbrValue,
    },
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    /// Graphic metadata is carried uninterpreted
    Graphics {
        status: Status,
        metadata: Vec<u8>,
        value: DbrValue,
    },
    Control {
        status: Status,
        metadata: Vec<u8>,
        value: DbrValue,
    },
    ClassName(String),
}

fn to_epics_time(timestamp: SystemTime) -> (u32, u32) {
    let since_unix = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET);
    (seconds.min(u32::MAX as u64) as u32, since_unix.subsec_nanos())
}

fn from_epics_time(seconds: u32, nanoseconds: u32) -> SystemTime {
    UNIX_EPOCH + Duration::new(seconds as u64 + EPICS_EPOCH_OFFSET, nanoseconds.min(999_999_999))
}

impl Dbr {
    fn value_ref(&self) -> Option<&DbrValue> {
        match self {
            Dbr::Basic(value)
            | Dbr::Status { value, .. }
            | Dbr::Time { value, .. }
            | Dbr::Graphics { value, .. }
            | Dbr::Control { value, .. } => Some(value),
            Dbr::ClassName(_) => None,
        }
    }

    pub fn value(&self) -> DbrValue {
        match self {
            Dbr::Basic(value)
            | Dbr::Status { value, .. }
            | Dbr::Time { value, .. }
            | Dbr::Graphics { value, .. }
            | Dbr::Control { value, .. } => value.clone(),
            Dbr::ClassName(name) => DbrValue::String(vec![name.clone()]),
        }
    }

    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value)
            | Dbr::Status { value, .. }
            | Dbr::Time { value, .. }
            | Dbr::Graphics { value, .. }
            | Dbr::Control { value, .. } => value,
            Dbr::ClassName(name) => DbrValue::String(vec![name]),
        }
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) | Dbr::ClassName(_) => None,
            Dbr::Status { status, .. }
            | Dbr::Time { status, .. }
            | Dbr::Graphics { status, .. }
            | Dbr::Control { status, .. } => Some(*status),
        }
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }

    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::ClassName(_) => return DBR_CLASS_NAME,
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        let basic_type = self
            .value_ref()
            .map_or(DbrBasicType::String, DbrValue::basic_type);
        DbrType::new(basic_type, category)
    }

    /// Decode a DBR from a message payload.
    ///
    /// Fails rather than panics if the payload cannot hold `data_count` elements.
    pub fn from_bytes(data_type: DbrType, data_count: usize, data: &[u8]) -> Result<Dbr, DbrError> {
        let needed = data_type.payload_size(data_count);
        let truncated = || DbrError::Truncated {
            dbr_type: data_type,
            count: data_count,
            needed,
            actual: data.len(),
        };
        // A single string may arrive cut short after its terminator
        let padded;
        let data = if data_type.basic_type == DbrBasicType::String
            && data_count > 0
            && data.len() < needed
            && data.len() > needed - MAX_STRING_SIZE
        {
            padded = {
                let mut bytes = data.to_vec();
                bytes.resize(needed, 0);
                bytes
            };
            &padded[..]
        } else {
            data
        };
        if data.len() < needed {
            return Err(truncated());
        }
        let metadata = &data[..data_type.metadata_size()];
        let (_, value) = DbrValue::decode(
            data_type.basic_type,
            data_count,
            &data[data_type.metadata_size()..],
        )
        .map_err(|_| truncated())?;

        let status = || -> Status {
            Status {
                status: i16::from_be_bytes([metadata[0], metadata[1]]),
                severity: i16::from_be_bytes([metadata[2], metadata[3]]),
            }
        };
        Ok(match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::ClassName => match value {
                DbrValue::String(mut names) if !names.is_empty() => {
                    Dbr::ClassName(names.swap_remove(0))
                }
                _ => Dbr::ClassName(String::new()),
            },
            DbrCategory::Status => Dbr::Status {
                status: status(),
                value,
            },
            DbrCategory::Time => {
                let (_, (seconds, nanoseconds)) = (be_u32, be_u32)
                    .parse(&metadata[4..])
                    .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| truncated())?;
                Dbr::Time {
                    status: status(),
                    timestamp: from_epics_time(seconds, nanoseconds),
                    value,
                }
            }
            DbrCategory::Graphics => Dbr::Graphics {
                status: status(),
                metadata: metadata[4..].to_vec(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status: status(),
                metadata: metadata[4..].to_vec(),
                value,
            },
        })
    }

    /// Encode metadata and up to `max_elements` values (unpadded).
    ///
    /// Returns the number of elements actually encoded.
    pub fn to_bytes(&self, max_elements: Option<usize>) -> (usize, Vec<u8>) {
        let data_type = self.data_type();
        let mut out = Vec::with_capacity(data_type.metadata_size());
        if let Some(status) = self.status() {
            out.extend(status.status.to_be_bytes());
            out.extend(status.severity.to_be_bytes());
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let (seconds, nanoseconds) = to_epics_time(*timestamp);
                out.extend(seconds.to_be_bytes());
                out.extend(nanoseconds.to_be_bytes());
            }
            Dbr::Graphics { metadata, .. } | Dbr::Control { metadata, .. } => {
                out.extend_from_slice(metadata)
            }
            _ => (),
        }
        // Alignment padding, or missing opaque metadata
        out.resize(data_type.metadata_size(), 0);

        let (elements, bytes) = match self.value_ref() {
            Some(value) => value.encode(max_elements),
            None => self.value().encode(Some(1)),
        };
        out.extend(bytes);
        (elements, out)
    }

    /// Convert to another DBR type, keeping whatever metadata still applies
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        if dbr_type.category == DbrCategory::ClassName {
            return match self {
                Dbr::ClassName(_) => Ok(self.clone()),
                _ => Err(ErrorCondition::NoConvert),
            };
        }
        if let Dbr::ClassName(_) = self {
            return Err(ErrorCondition::NoConvert);
        }
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        let metadata_length = dbr_type.metadata_size().saturating_sub(4);
        let metadata = match self {
            Dbr::Graphics { metadata, .. } | Dbr::Control { metadata, .. }
                if self.data_type().basic_type == dbr_type.basic_type =>
            {
                let mut metadata = metadata.clone();
                metadata.resize(metadata_length, 0);
                metadata
            }
            _ => vec![0; metadata_length],
        };
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp().unwrap_or_else(SystemTime::now),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                metadata,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                metadata,
                value,
            },
            DbrCategory::ClassName => unreachable!("handled above"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes() {
        for code in (0u16..35).chain([38]) {
            let dbr_type = DbrType::try_from(code).unwrap();
            assert_eq!(<u16 as From<DbrType>>::from(dbr_type), code);
        }
        assert!(DbrType::try_from(35).is_err());
        assert!(DbrType::try_from(39).is_err());
        assert_eq!(
            DbrType::try_from(20).unwrap(),
            DbrType::new(DbrBasicType::Double, DbrCategory::Time)
        );
    }

    #[test]
    fn metadata_sizes_match_db_access() {
        // dbr_size[] from db_access.h, minus one value element
        let expected = [
            (DbrType::new(DbrBasicType::Double, DbrCategory::Time), 16),
            (DbrType::new(DbrBasicType::Char, DbrCategory::Time), 15),
            (DbrType::new(DbrBasicType::Char, DbrCategory::Status), 5),
            (DbrType::new(DbrBasicType::Enum, DbrCategory::Control), 422),
            (DbrType::new(DbrBasicType::Double, DbrCategory::Control), 80),
            (DbrType::new(DbrBasicType::Float, DbrCategory::Graphics), 40),
        ];
        for (dbr_type, size) in expected {
            assert_eq!(dbr_type.metadata_size(), size, "{dbr_type}");
        }
    }

    #[test]
    fn names() {
        assert_eq!(
            "DBR_STS_INT".parse::<DbrType>().unwrap(),
            DbrType::new(DbrBasicType::Int, DbrCategory::Status)
        );
        assert_eq!(
            "time_short".parse::<DbrType>().unwrap(),
            DbrType::new(DbrBasicType::Int, DbrCategory::Time)
        );
        assert_eq!("DOUBLE".parse::<DbrType>().unwrap().category, DbrCategory::Basic);
        assert_eq!("DBR_CLASS_NAME".parse::<DbrType>().unwrap(), DBR_CLASS_NAME);
        assert!("DBR_CLASS_INT".parse::<DbrType>().is_err());
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Graphics).to_string(),
            "DBR_GR_DOUBLE"
        );
    }

    #[test]
    fn time_long_layout() {
        let packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: UNIX_EPOCH + Duration::from_secs(1741731609),
            value: 42i32.into(),
        };
        let (elements, bytes) = dbr.to_bytes(None);
        assert_eq!(elements, 1);
        assert_eq!(bytes, packet);
        let decoded =
            Dbr::from_bytes(DbrType::new(DbrBasicType::Long, DbrCategory::Time), 1, &packet)
                .unwrap();
        assert_eq!(decoded, dbr);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let dbr_type = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        let result = Dbr::from_bytes(dbr_type, 2, &[0u8; 20]);
        assert!(matches!(result, Err(DbrError::Truncated { needed: 32, .. })));
    }

    #[test]
    fn shortened_single_string() {
        let dbr_type = DbrType::new(DbrBasicType::String, DbrCategory::Basic);
        let decoded = Dbr::from_bytes(dbr_type, 1, b"abc\0\0\0\0\0").unwrap();
        assert_eq!(decoded, Dbr::Basic(DbrValue::from("abc")));
    }

    #[test]
    fn conversions() {
        let v: DbrValue = vec![500.23f32, 12.7f32].into();
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap(),
            DbrValue::Int(vec![500, 12])
        );
        assert!(DbrValue::Long(vec![500]).convert_to(DbrBasicType::Char).is_err());
        assert_eq!(
            DbrValue::from("42").convert_to(DbrBasicType::Long).unwrap(),
            DbrValue::Long(vec![42])
        );
        let chars = DbrValue::from("a test string")
            .convert_to(DbrBasicType::Char)
            .unwrap();
        assert_eq!(
            chars.convert_to(DbrBasicType::String).unwrap(),
            DbrValue::from("a test string")
        );
        assert_eq!(i16::try_from(DbrValue::Double(vec![3.0])).unwrap(), 3);
    }

    #[test]
    fn long_strings_are_truncated() {
        let long = "x".repeat(60);
        let (_, bytes) = DbrValue::from(long.as_str()).encode(None);
        assert_eq!(bytes.len(), MAX_STRING_SIZE);
        assert_eq!(bytes[MAX_STRING_SIZE - 1], 0);
        assert_eq!(fixed_string(&bytes), "x".repeat(39));
    }

    #[test]
    fn graphics_metadata_survives() {
        let dbr_type = DbrType::new(DbrBasicType::Long, DbrCategory::Graphics);
        let mut payload = vec![0u8, 1, 0, 2];
        payload.extend((0u8..32).collect::<Vec<_>>());
        payload.extend(7i32.to_be_bytes());
        let dbr = Dbr::from_bytes(dbr_type, 1, &payload).unwrap();
        assert_eq!(dbr.status(), Some(Status { status: 1, severity: 2 }));
        assert_eq!(dbr.to_bytes(None).1, payload);
    }
}
