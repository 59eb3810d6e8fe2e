//! Resource descriptors.
//!
//! A descriptor names one addressable endpoint, e.g. `GPIB0::2::INSTR` or
//! `TCPIP0::192.168.1.50::5025::SOCKET`. Parsing is case-insensitive on
//! keywords and normalises to a canonical string, which is what the
//! registry, the lock manager and the `ResourceName` attribute use.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Hardware interface family of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Gpib,
    Vxi,
    Asrl,
    Tcpip,
    Usb,
}

impl InterfaceType {
    /// VISA interface-type number.
    pub fn raw(&self) -> u16 {
        match self {
            InterfaceType::Gpib => 1,
            InterfaceType::Vxi => 2,
            InterfaceType::Asrl => 4,
            InterfaceType::Tcpip => 6,
            InterfaceType::Usb => 7,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            InterfaceType::Gpib => "GPIB",
            InterfaceType::Vxi => "VXI",
            InterfaceType::Asrl => "ASRL",
            InterfaceType::Tcpip => "TCPIP",
            InterfaceType::Usb => "USB",
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())
    }
}

/// Resource class suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Instr,
    Intfc,
    Socket,
    Raw,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceClass::Instr => "INSTR",
            ResourceClass::Intfc => "INTFC",
            ResourceClass::Socket => "SOCKET",
            ResourceClass::Raw => "RAW",
        };
        write!(f, "{s}")
    }
}

/// Interface-specific address part of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// GPIB device (primary address 0..=30, optional secondary 0..=30).
    Gpib { primary: u8, secondary: Option<u8> },
    /// A bus interface itself (`GPIB0::INTFC`).
    Interface,
    /// VXI-11 / HiSLIP style instrument on a LAN host.
    TcpipInstr { host: String, device: String },
    /// Raw TCP socket.
    TcpipSocket { host: String, port: u16 },
    /// Serial port, either by board number or by OS path.
    Asrl { path: Option<String> },
    /// USB-TMC or raw USB device.
    Usb {
        vendor: u16,
        product: u16,
        serial: String,
        interface: Option<u16>,
    },
    /// VXI device by logical address.
    Vxi { logical: u16 },
}

/// A parsed, immutable resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    interface: InterfaceType,
    board: u16,
    address: Address,
    class: ResourceClass,
}

const DEFAULT_LAN_DEVICE: &str = "inst0";

impl ResourceDescriptor {
    /// Parse a resource name.
    ///
    /// ```
    /// use visalib_core::{InterfaceType, ResourceDescriptor};
    ///
    /// let d = ResourceDescriptor::parse("gpib::2").unwrap();
    /// assert_eq!(d.interface(), InterfaceType::Gpib);
    /// assert_eq!(d.to_string(), "GPIB0::2::INSTR");
    /// ```
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidDescriptor(format!("{name}: {why}"));

        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty resource name"));
        }

        let parts: Vec<&str> = name.split("::").collect();
        let head = parts[0];
        let upper = head.to_ascii_uppercase();

        // Longest keyword first so that e.g. "USB" is not shadowed.
        let (interface, rest) = [
            InterfaceType::Tcpip,
            InterfaceType::Gpib,
            InterfaceType::Asrl,
            InterfaceType::Usb,
            InterfaceType::Vxi,
        ]
        .into_iter()
        .find_map(|i| {
            upper
                .starts_with(i.keyword())
                .then(|| (i, &head[i.keyword().len()..]))
        })
        .ok_or_else(|| invalid("unknown interface type"))?;

        let mut tail: Vec<&str> = parts[1..].to_vec();
        let class = match tail.last().map(|s| s.to_ascii_uppercase()) {
            Some(s) if s == "INSTR" => {
                tail.pop();
                Some(ResourceClass::Instr)
            }
            Some(s) if s == "INTFC" => {
                tail.pop();
                Some(ResourceClass::Intfc)
            }
            Some(s) if s == "SOCKET" => {
                tail.pop();
                Some(ResourceClass::Socket)
            }
            Some(s) if s == "RAW" => {
                tail.pop();
                Some(ResourceClass::Raw)
            }
            _ => None,
        };

        if tail.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty address field"));
        }

        // Serial ports may carry an OS path in place of the board number.
        if interface == InterfaceType::Asrl && !rest.is_empty() && !is_decimal(rest) {
            if !tail.is_empty() || !matches!(class, None | Some(ResourceClass::Instr)) {
                return Err(invalid("serial resources take no address fields"));
            }
            return Ok(Self {
                interface,
                board: 0,
                address: Address::Asrl {
                    path: Some(rest.to_string()),
                },
                class: ResourceClass::Instr,
            });
        }

        let board = if rest.is_empty() {
            0
        } else {
            rest.parse::<u16>()
                .map_err(|_| invalid("board number is not a number"))?
        };

        let (address, class) = match (interface, class) {
            (InterfaceType::Gpib, Some(ResourceClass::Intfc)) if tail.is_empty() => {
                (Address::Interface, ResourceClass::Intfc)
            }
            (InterfaceType::Gpib, None | Some(ResourceClass::Instr)) => {
                let (primary, secondary) = match tail.as_slice() {
                    [p] => (parse_gpib_addr(p), None),
                    [p, s] => (parse_gpib_addr(p), Some(parse_gpib_addr(s))),
                    _ => return Err(invalid("expected primary[::secondary] address")),
                };
                let primary = primary.ok_or_else(|| invalid("GPIB address out of range"))?;
                let secondary = match secondary {
                    Some(s) => Some(s.ok_or_else(|| invalid("GPIB address out of range"))?),
                    None => None,
                };
                (Address::Gpib { primary, secondary }, ResourceClass::Instr)
            }
            (InterfaceType::Tcpip, Some(ResourceClass::Socket)) => match tail.as_slice() {
                [host, port] => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| invalid("socket port is not a number"))?;
                    (
                        Address::TcpipSocket {
                            host: host.to_ascii_lowercase(),
                            port,
                        },
                        ResourceClass::Socket,
                    )
                }
                _ => return Err(invalid("expected host::port::SOCKET")),
            },
            (InterfaceType::Tcpip, None | Some(ResourceClass::Instr)) => {
                let (host, device) = match tail.as_slice() {
                    [host] => (host.to_ascii_lowercase(), DEFAULT_LAN_DEVICE.to_string()),
                    [host, device] => (host.to_ascii_lowercase(), device.to_string()),
                    _ => return Err(invalid("expected host[::device]")),
                };
                (Address::TcpipInstr { host, device }, ResourceClass::Instr)
            }
            (InterfaceType::Asrl, None | Some(ResourceClass::Instr)) if tail.is_empty() => {
                (Address::Asrl { path: None }, ResourceClass::Instr)
            }
            (InterfaceType::Usb, None | Some(ResourceClass::Instr) | Some(ResourceClass::Raw)) => {
                let (vendor, product, serial, interface) = match tail.as_slice() {
                    [v, p, s] => (*v, *p, *s, None),
                    [v, p, s, i] => (*v, *p, *s, Some(*i)),
                    _ => return Err(invalid("expected vendor::product::serial[::interface]")),
                };
                let vendor = parse_id(vendor).ok_or_else(|| invalid("bad USB vendor id"))?;
                let product = parse_id(product).ok_or_else(|| invalid("bad USB product id"))?;
                let interface = match interface {
                    Some(i) => Some(i.parse::<u16>().map_err(|_| invalid("bad USB interface"))?),
                    None => None,
                };
                (
                    Address::Usb {
                        vendor,
                        product,
                        serial: serial.to_string(),
                        interface,
                    },
                    class.unwrap_or(ResourceClass::Instr),
                )
            }
            (InterfaceType::Vxi, None | Some(ResourceClass::Instr)) => match tail.as_slice() {
                [la] => {
                    let logical = la
                        .parse::<u16>()
                        .ok()
                        .filter(|la| *la <= 255)
                        .ok_or_else(|| invalid("VXI logical address out of range"))?;
                    (Address::Vxi { logical }, ResourceClass::Instr)
                }
                _ => return Err(invalid("expected logical address")),
            },
            _ => return Err(invalid("unsupported resource class for interface")),
        };

        Ok(Self {
            interface,
            board,
            address,
            class,
        })
    }

    /// Interface family.
    pub fn interface(&self) -> InterfaceType {
        self.interface
    }

    /// Board (interface) number.
    pub fn board(&self) -> u16 {
        self.board
    }

    /// Interface-specific address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Resource class.
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Host name for TCPIP resources.
    pub fn host(&self) -> Option<&str> {
        match &self.address {
            Address::TcpipInstr { host, .. } | Address::TcpipSocket { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Port for TCPIP socket resources.
    pub fn port(&self) -> Option<u16> {
        match &self.address {
            Address::TcpipSocket { port, .. } => Some(*port),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Asrl { path: Some(path) } => write!(f, "ASRL{path}::INSTR"),
            Address::Asrl { path: None } => write!(f, "ASRL{}::INSTR", self.board),
            Address::Gpib { primary, secondary } => {
                write!(f, "GPIB{}::{primary}", self.board)?;
                if let Some(s) = secondary {
                    write!(f, "::{s}")?;
                }
                write!(f, "::{}", self.class)
            }
            Address::Interface => write!(f, "{}{}::{}", self.interface, self.board, self.class),
            Address::TcpipInstr { host, device } => {
                write!(f, "TCPIP{}::{host}::{device}::{}", self.board, self.class)
            }
            Address::TcpipSocket { host, port } => {
                write!(f, "TCPIP{}::{host}::{port}::{}", self.board, self.class)
            }
            Address::Usb {
                vendor,
                product,
                serial,
                interface,
            } => {
                write!(f, "USB{}::0x{vendor:04X}::0x{product:04X}::{serial}", self.board)?;
                if let Some(i) = interface {
                    write!(f, "::{i}")?;
                }
                write!(f, "::{}", self.class)
            }
            Address::Vxi { logical } => write!(f, "VXI{}::{logical}::{}", self.board, self.class),
        }
    }
}

impl FromStr for ResourceDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_gpib_addr(s: &str) -> Option<u8> {
    s.parse::<u8>().ok().filter(|a| *a <= 30)
}

fn parse_id(s: &str) -> Option<u16> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse::<u16>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpib_short_form_defaults() {
        let d = ResourceDescriptor::parse("GPIB::2").unwrap();
        assert_eq!(d.interface(), InterfaceType::Gpib);
        assert_eq!(d.board(), 0);
        assert_eq!(
            d.address(),
            &Address::Gpib {
                primary: 2,
                secondary: None
            }
        );
        assert_eq!(d.class(), ResourceClass::Instr);
        assert_eq!(d.to_string(), "GPIB0::2::INSTR");
    }

    #[test]
    fn gpib_with_secondary_and_board() {
        let d = ResourceDescriptor::parse("gpib1::5::3::instr").unwrap();
        assert_eq!(d.board(), 1);
        assert_eq!(d.to_string(), "GPIB1::5::3::INSTR");
    }

    #[test]
    fn gpib_address_out_of_range() {
        let err = ResourceDescriptor::parse("GPIB0::31::INSTR").unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn gpib_interface() {
        let d = ResourceDescriptor::parse("GPIB0::INTFC").unwrap();
        assert_eq!(d.class(), ResourceClass::Intfc);
        assert_eq!(d.address(), &Address::Interface);
        assert_eq!(d.to_string(), "GPIB0::INTFC");
    }

    #[test]
    fn tcpip_socket() {
        let d = ResourceDescriptor::parse("TCPIP0::ftp.ni.com::21::SOCKET").unwrap();
        assert_eq!(d.interface(), InterfaceType::Tcpip);
        assert_eq!(d.class(), ResourceClass::Socket);
        assert_eq!(d.host(), Some("ftp.ni.com"));
        assert_eq!(d.port(), Some(21));
        assert_eq!(d.to_string(), "TCPIP0::ftp.ni.com::21::SOCKET");
    }

    #[test]
    fn tcpip_instr_default_device() {
        let d = ResourceDescriptor::parse("TCPIP::10.0.0.5::INSTR").unwrap();
        assert_eq!(d.to_string(), "TCPIP0::10.0.0.5::inst0::INSTR");
        assert_eq!(d.port(), None);
    }

    #[test]
    fn tcpip_host_is_case_insensitive() {
        let upper: ResourceDescriptor = "TCPIP::Scope-Lab.Example.COM::5025::SOCKET".parse().unwrap();
        let lower: ResourceDescriptor = "tcpip0::scope-lab.example.com::5025::socket".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "TCPIP0::scope-lab.example.com::5025::SOCKET");
        assert_eq!(upper.host(), Some("scope-lab.example.com"));

        let instr = ResourceDescriptor::parse("TCPIP0::DMM-7::inst0::INSTR").unwrap();
        assert_eq!(instr.to_string(), "TCPIP0::dmm-7::inst0::INSTR");
    }

    #[test]
    fn tcpip_socket_bad_port() {
        assert!(ResourceDescriptor::parse("TCPIP0::host::http::SOCKET").is_err());
    }

    #[test]
    fn asrl_by_number_and_path() {
        let d = ResourceDescriptor::parse("ASRL3::INSTR").unwrap();
        assert_eq!(d.board(), 3);
        assert_eq!(d.address(), &Address::Asrl { path: None });
        assert_eq!(d.to_string(), "ASRL3::INSTR");

        let d = ResourceDescriptor::parse("ASRL/dev/ttyUSB0::INSTR").unwrap();
        assert_eq!(
            d.address(),
            &Address::Asrl {
                path: Some("/dev/ttyUSB0".into())
            }
        );
        assert_eq!(d.to_string(), "ASRL/dev/ttyUSB0::INSTR");
    }

    #[test]
    fn usb_hex_and_decimal_ids() {
        let d = ResourceDescriptor::parse("USB0::0x0957::6407::MY1234::INSTR").unwrap();
        assert_eq!(
            d.address(),
            &Address::Usb {
                vendor: 0x0957,
                product: 6407,
                serial: "MY1234".into(),
                interface: None
            }
        );
        assert_eq!(d.to_string(), "USB0::0x0957::0x1907::MY1234::INSTR");
    }

    #[test]
    fn usb_raw_class() {
        let d = ResourceDescriptor::parse("USB::0x1234::0x5678::SN::2::RAW").unwrap();
        assert_eq!(d.class(), ResourceClass::Raw);
        assert_eq!(d.to_string(), "USB0::0x1234::0x5678::SN::2::RAW");
    }

    #[test]
    fn vxi_logical_address() {
        let d = ResourceDescriptor::parse("VXI0::24::INSTR").unwrap();
        assert_eq!(d.address(), &Address::Vxi { logical: 24 });
        assert_eq!(d.interface().raw(), 2);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "FOO::1", "GPIB0::", "GPIBx::1", "TCPIP0::host::1::2::3", "GPIB0::1::SOCKET"] {
            let err = ResourceDescriptor::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidDescriptor(_)), "{bad}");
        }
    }

    #[test]
    fn canonical_form_is_stable() {
        let a: ResourceDescriptor = "gpib0::2::instr".parse().unwrap();
        let b: ResourceDescriptor = "GPIB::2".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }
}
