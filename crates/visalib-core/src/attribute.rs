//! Session attributes.
//!
//! Attributes form a closed registry: every supported attribute has an
//! [`AttrKind`] with a fixed raw id, a payload type, an access mode and a
//! set of resources it applies to. Values travel as the [`Attribute`]
//! tagged union, so a `TermChar` can never be set to a string.
//!
//! The raw entry points (`Attribute::from_raw`, [`Attribute::to_raw`]) exist
//! for callers porting code written against numeric attribute ids; they are
//! validated into the typed form at the boundary.

use std::fmt;

use crate::descriptor::{InterfaceType, ResourceClass, ResourceDescriptor};
use crate::error::{Error, Result};
use crate::types::{AccessMode, Timeout};

/// Largest accepted value for [`AttrKind::MaxQueueLength`].
pub const MAX_QUEUE_LENGTH_CAP: u32 = 65_536;

/// Default queue length for queued event delivery.
pub const DEFAULT_QUEUE_LENGTH: u32 = 50;

/// Default termination character.
pub const DEFAULT_TERM_CHAR: u8 = b'\n';

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Identifies one attribute in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttrKind {
    Timeout,
    TermChar,
    TermCharEnabled,
    MaxQueueLength,
    TcpNoDelay,
    AsrlBaud,
    ResourceName,
    ResourceClass,
    InterfaceType,
    InterfaceNumber,
    TcpHostname,
    TcpPort,
    LockState,
}

impl AttrKind {
    /// Every attribute in the registry.
    pub const ALL: [AttrKind; 13] = [
        AttrKind::Timeout,
        AttrKind::TermChar,
        AttrKind::TermCharEnabled,
        AttrKind::MaxQueueLength,
        AttrKind::TcpNoDelay,
        AttrKind::AsrlBaud,
        AttrKind::ResourceName,
        AttrKind::ResourceClass,
        AttrKind::InterfaceType,
        AttrKind::InterfaceNumber,
        AttrKind::TcpHostname,
        AttrKind::TcpPort,
        AttrKind::LockState,
    ];

    /// Raw VISA attribute id.
    pub fn raw(&self) -> u32 {
        match self {
            AttrKind::Timeout => 0x3FFF_001A,
            AttrKind::TermChar => 0x3FFF_0018,
            AttrKind::TermCharEnabled => 0x3FFF_0038,
            AttrKind::MaxQueueLength => 0x3FFF_0005,
            AttrKind::TcpNoDelay => 0x3FFF_019A,
            AttrKind::AsrlBaud => 0x3FFF_0021,
            AttrKind::ResourceName => 0xBFFF_0002,
            AttrKind::ResourceClass => 0xBFFF_0001,
            AttrKind::InterfaceType => 0x3FFF_0171,
            AttrKind::InterfaceNumber => 0x3FFF_0176,
            AttrKind::TcpHostname => 0xBFFF_0196,
            AttrKind::TcpPort => 0x3FFF_0197,
            AttrKind::LockState => 0x3FFF_0004,
        }
    }

    /// Look up an attribute by raw id.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.raw() == raw)
            .ok_or_else(|| Error::InvalidAttribute(format!("{raw:#010X}")))
    }

    /// Whether the attribute may be set by the caller.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            AttrKind::Timeout
                | AttrKind::TermChar
                | AttrKind::TermCharEnabled
                | AttrKind::MaxQueueLength
                | AttrKind::TcpNoDelay
                | AttrKind::AsrlBaud
        )
    }

    /// Whether the attribute exists for sessions on `descriptor`.
    pub fn applies_to(&self, descriptor: &ResourceDescriptor) -> bool {
        match self {
            AttrKind::TcpNoDelay | AttrKind::TcpHostname => {
                descriptor.interface() == InterfaceType::Tcpip
            }
            AttrKind::TcpPort => {
                descriptor.interface() == InterfaceType::Tcpip
                    && descriptor.class() == ResourceClass::Socket
            }
            AttrKind::AsrlBaud => descriptor.interface() == InterfaceType::Asrl,
            _ => true,
        }
    }
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// I/O and lock timeout.
    Timeout(Timeout),
    /// Byte that ends a read when termination is enabled.
    TermChar(u8),
    /// Whether reads stop at [`Attribute::TermChar`].
    TermCharEnabled(bool),
    /// Capacity of each queued-event FIFO.
    MaxQueueLength(u32),
    /// Disable Nagle's algorithm on TCP sockets.
    TcpNoDelay(bool),
    /// Serial line speed.
    AsrlBaud(u32),
    /// Canonical resource name.
    ResourceName(String),
    /// Resource class suffix, e.g. `INSTR`.
    ResourceClass(String),
    /// VISA interface-type number.
    InterfaceType(u16),
    /// Board number.
    InterfaceNumber(u16),
    /// Host of a TCPIP resource.
    TcpHostname(String),
    /// Port of a TCPIP socket resource.
    TcpPort(u16),
    /// Lock currently held by the session.
    LockState(AccessMode),
}

impl Attribute {
    /// The kind of this value.
    pub fn kind(&self) -> AttrKind {
        match self {
            Attribute::Timeout(_) => AttrKind::Timeout,
            Attribute::TermChar(_) => AttrKind::TermChar,
            Attribute::TermCharEnabled(_) => AttrKind::TermCharEnabled,
            Attribute::MaxQueueLength(_) => AttrKind::MaxQueueLength,
            Attribute::TcpNoDelay(_) => AttrKind::TcpNoDelay,
            Attribute::AsrlBaud(_) => AttrKind::AsrlBaud,
            Attribute::ResourceName(_) => AttrKind::ResourceName,
            Attribute::ResourceClass(_) => AttrKind::ResourceClass,
            Attribute::InterfaceType(_) => AttrKind::InterfaceType,
            Attribute::InterfaceNumber(_) => AttrKind::InterfaceNumber,
            Attribute::TcpHostname(_) => AttrKind::TcpHostname,
            Attribute::TcpPort(_) => AttrKind::TcpPort,
            Attribute::LockState(_) => AttrKind::LockState,
        }
    }

    /// Build a writable attribute from a raw id and raw value.
    ///
    /// Fails with [`Error::InvalidAttribute`] for unknown ids,
    /// [`Error::AttributeReadOnly`] for read-only kinds, and
    /// [`Error::InvalidAttributeState`] when the value is out of range.
    pub fn from_raw(id: u32, value: u64) -> Result<Self> {
        let kind = AttrKind::from_raw(id)?;
        let out_of_range = || Error::InvalidAttributeState(format!("{kind} = {value:#X}"));
        let attr = match kind {
            AttrKind::Timeout => {
                let ms = u32::try_from(value).map_err(|_| out_of_range())?;
                Attribute::Timeout(Timeout::from_millis(ms))
            }
            AttrKind::TermChar => {
                Attribute::TermChar(u8::try_from(value).map_err(|_| out_of_range())?)
            }
            AttrKind::TermCharEnabled => {
                Attribute::TermCharEnabled(raw_bool(value).ok_or_else(out_of_range)?)
            }
            AttrKind::TcpNoDelay => {
                Attribute::TcpNoDelay(raw_bool(value).ok_or_else(out_of_range)?)
            }
            AttrKind::MaxQueueLength => {
                Attribute::MaxQueueLength(u32::try_from(value).map_err(|_| out_of_range())?)
            }
            AttrKind::AsrlBaud => {
                Attribute::AsrlBaud(u32::try_from(value).map_err(|_| out_of_range())?)
            }
            read_only => return Err(Error::AttributeReadOnly(read_only)),
        };
        attr.validate()?;
        Ok(attr)
    }

    /// Numeric form of the value, or `None` for string attributes.
    pub fn to_raw(&self) -> Option<u64> {
        match self {
            Attribute::Timeout(t) => Some(u64::from(t.as_millis())),
            Attribute::TermChar(c) => Some(u64::from(*c)),
            Attribute::TermCharEnabled(b) | Attribute::TcpNoDelay(b) => Some(u64::from(*b)),
            Attribute::MaxQueueLength(n) | Attribute::AsrlBaud(n) => Some(u64::from(*n)),
            Attribute::InterfaceType(n) | Attribute::InterfaceNumber(n) | Attribute::TcpPort(n) => {
                Some(u64::from(*n))
            }
            Attribute::LockState(mode) => Some(u64::from(mode.raw())),
            Attribute::ResourceName(_) | Attribute::ResourceClass(_) | Attribute::TcpHostname(_) => {
                None
            }
        }
    }

    /// Check the value against the range allowed for its kind.
    pub fn validate(&self) -> Result<()> {
        match self {
            Attribute::MaxQueueLength(n) if *n == 0 || *n > MAX_QUEUE_LENGTH_CAP => Err(
                Error::InvalidAttributeState(format!(
                    "MaxQueueLength must be 1..={MAX_QUEUE_LENGTH_CAP}, got {n}"
                )),
            ),
            Attribute::AsrlBaud(0) => Err(Error::InvalidAttributeState(
                "AsrlBaud must be non-zero".into(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Timeout(t) => write!(f, "Timeout = {t}"),
            Attribute::TermChar(c) => write!(f, "TermChar = {c:#04X}"),
            Attribute::LockState(mode) => write!(f, "LockState = {mode}"),
            Attribute::ResourceName(s) | Attribute::ResourceClass(s) | Attribute::TcpHostname(s) => {
                write!(f, "{} = {s}", self.kind())
            }
            other => match other.to_raw() {
                Some(raw) => write!(f, "{} = {raw}", other.kind()),
                None => write!(f, "{}", other.kind()),
            },
        }
    }
}

fn raw_bool(value: u64) -> Option<bool> {
    match value {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}
