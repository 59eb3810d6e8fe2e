//! Serial port transport.
//!
//! [`SerialTransport`] carries `ASRL` resources. A numbered resource maps
//! onto the platform's numbered ports (`ASRL1` is `COM1` on Windows and
//! `/dev/ttyS0` elsewhere); a resource written with a path, such as
//! `ASRL/dev/ttyUSB0::INSTR`, opens that path verbatim.
//!
//! # Example
//!
//! ```no_run
//! use visalib_core::ResourceDescriptor;
//! use visalib_core::transport::Transport;
//! use visalib_transport::{SerialConfig, SerialTransport};
//! use std::time::Duration;
//!
//! # async fn example() -> visalib_core::Result<()> {
//! let d = ResourceDescriptor::parse("ASRL/dev/ttyUSB0::INSTR")?;
//! let mut transport = SerialTransport::open(&d, SerialConfig::default())?;
//! transport.send(b"*RST\r\n").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use visalib_core::attribute::DEFAULT_BAUD_RATE;
use visalib_core::descriptor::{Address, ResourceDescriptor};
use visalib_core::error::{Error, Result};
use visalib_core::transport::{Transport, TransportSetting};

/// Serial line settings.
///
/// Defaults are 9600 baud, 8 data bits, 1 stop bit, no parity and no flow
/// control, which is what most bench instruments ship with.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Resolve the OS port path for an `ASRL` descriptor.
pub fn port_path(descriptor: &ResourceDescriptor) -> Result<String> {
    match descriptor.address() {
        Address::Asrl { path: Some(path) } => Ok(path.clone()),
        Address::Asrl { path: None } => {
            let n = descriptor.board();
            if n == 0 {
                return Err(Error::InvalidParameter(format!(
                    "{descriptor}: serial ports are numbered from 1"
                )));
            }
            if cfg!(windows) {
                Ok(format!("COM{n}"))
            } else {
                Ok(format!("/dev/ttyS{}", n - 1))
            }
        }
        _ => Err(Error::InvalidParameter(format!(
            "{descriptor} is not an ASRL resource"
        ))),
    }
}

/// List the serial ports present on this machine as `ASRL<path>::INSTR`
/// descriptors.
pub fn available_ports() -> Result<Vec<ResourceDescriptor>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Transport(format!("serial port enumeration failed: {e}")))?;

    let mut found = Vec::with_capacity(ports.len());
    for port in ports {
        match ResourceDescriptor::parse(&format!("ASRL{}::INSTR", port.port_name)) {
            Ok(d) => found.push(d),
            Err(e) => {
                tracing::debug!(port = %port.port_name, error = %e, "Skipping serial port");
            }
        }
    }
    Ok(found)
}

/// Serial transport for `ASRL` resources.
pub struct SerialTransport {
    port: Option<SerialStream>,
    port_name: String,
}

impl SerialTransport {
    /// Open the port named by an `ASRL` descriptor.
    pub fn open(descriptor: &ResourceDescriptor, config: SerialConfig) -> Result<Self> {
        let path = port_path(descriptor)?;
        Self::open_path(&path, config)
    }

    /// Open a serial port by OS path.
    pub fn open_path(path: &str, config: SerialConfig) -> Result<Self> {
        tracing::debug!(
            port = %path,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            "Opening serial port"
        );

        let mut stream = tokio_serial::new(path, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %path, error = %e, "Failed to open serial port");
                Error::Transport(format!("failed to open serial port {path}: {e}"))
            })?;

        // Instruments wired for RS-232 handshaking may treat an asserted
        // DTR/RTS as a request; leave both low until asked otherwise.
        if let Err(e) = stream.write_data_terminal_ready(false) {
            tracing::warn!(port = %path, error = %e, "Failed to de-assert DTR");
        }
        if let Err(e) = stream.write_request_to_send(false) {
            tracing::warn!(port = %path, error = %e, "Failed to de-assert RTS");
        }

        tracing::info!(port = %path, baud_rate = config.baud_rate, "Serial port opened");

        Ok(Self {
            port: Some(stream),
            port_name: path.to_string(),
        })
    }

    /// OS path of the port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(port = %self.port_name, bytes = data.len(), data = ?data, "Sending data");

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            map_io_error(e)
        })?;
        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to flush serial port");
            map_io_error(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                tracing::trace!(port = %self.port_name, bytes = n, data = ?&buf[..n], "Received data");
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn configure(&mut self, setting: TransportSetting) -> Result<()> {
        match setting {
            TransportSetting::BaudRate(baud) => {
                let port = self.port.as_mut().ok_or(Error::NotConnected)?;
                port.set_baud_rate(baud).map_err(|e| {
                    Error::Transport(format!("failed to set baud rate {baud}: {e}"))
                })?;
                tracing::debug!(port = %self.port_name, baud_rate = baud, "Baud rate updated");
            }
            other => {
                tracing::trace!(port = %self.port_name, setting = ?other, "Ignoring setting");
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }
            tracing::info!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn numbered_port_path() {
        let d = ResourceDescriptor::parse("ASRL3::INSTR").unwrap();
        let path = port_path(&d).unwrap();
        if cfg!(windows) {
            assert_eq!(path, "COM3");
        } else {
            assert_eq!(path, "/dev/ttyS2");
        }
    }

    #[test]
    fn explicit_port_path() {
        let d = ResourceDescriptor::parse("ASRL/dev/ttyACM1::INSTR").unwrap();
        assert_eq!(port_path(&d).unwrap(), "/dev/ttyACM1");
    }

    #[test]
    fn port_zero_and_non_serial_rejected() {
        let d = ResourceDescriptor::parse("ASRL0::INSTR").unwrap();
        assert!(matches!(port_path(&d), Err(Error::InvalidParameter(_))));

        let d = ResourceDescriptor::parse("GPIB0::1::INSTR").unwrap();
        assert!(matches!(port_path(&d), Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn opening_missing_port_is_transport_error() {
        let d = ResourceDescriptor::parse("ASRL/dev/visalib-no-such-port::INSTR").unwrap();
        let err = SerialTransport::open(&d, SerialConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn line_setting_conversions() {
        let _: tokio_serial::DataBits = DataBits::Seven.into();
        let _: tokio_serial::StopBits = StopBits::Two.into();
        let _: tokio_serial::Parity = Parity::Even.into();
        let _: tokio_serial::FlowControl = FlowControl::Hardware.into();
    }
}
