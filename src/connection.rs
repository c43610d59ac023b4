//! Opening devices and wiring them to protocols.

use crate::config::TransportConfig;
use crate::device::{Device, DeviceError, PortConfiguration, SerialDevice, SocketDevice};
use crate::error::TransportError;
use crate::runtime::{run_blocking, EventLoop};
use crate::transport::{Protocol, SerialTransport};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use tracing::debug;

const SOCKET_SCHEME: &str = "socket://";

/// Where a device lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A native serial port, such as `/dev/ttyUSB0` or `COM3`.
    Port(String),
    /// A serial bridge reachable over TCP, written `socket://host:port`.
    Socket { host: String, port: u16 },
}

impl Locator {
    /// Open the device. Blocks; call it off the loop thread.
    pub fn open(&self, config: &PortConfiguration) -> Result<Box<dyn Device>, DeviceError> {
        match self {
            Self::Port(name) => Ok(Box::new(SerialDevice::open(name, config)?)),
            Self::Socket { host, port } => Ok(Box::new(SocketDevice::connect(host, *port, config.timeout)?)),
        }
    }
}

impl FromStr for Locator {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TransportError::invalid_locator(s, "empty locator"));
        }

        let has_socket_scheme = trimmed
            .get(..SOCKET_SCHEME.len())
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case(SOCKET_SCHEME));
        if !has_socket_scheme {
            if trimmed.contains("://") {
                return Err(TransportError::invalid_locator(s, "unsupported scheme"));
            }
            return Ok(Self::Port(trimmed.to_string()));
        }

        // Options after '?' are accepted and ignored.
        let rest = &trimmed[SOCKET_SCHEME.len()..];
        let authority = rest.split(['?', '/']).next().unwrap_or_default();
        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| TransportError::invalid_locator(s, "unterminated IPv6 address"))?;
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| TransportError::invalid_locator(s, "missing port"))?;
                (host, port)
            }
            None => authority
                .rsplit_once(':')
                .ok_or_else(|| TransportError::invalid_locator(s, "missing port"))?,
        };
        if host.is_empty() {
            return Err(TransportError::invalid_locator(s, "missing host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::invalid_locator(s, format!("invalid port '{}'", port)))?;

        Ok(Self::Socket {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(name) => f.write_str(name),
            Self::Socket { host, port } if host.contains(':') => write!(f, "socket://[{}]:{}", host, port),
            Self::Socket { host, port } => write!(f, "socket://{}:{}", host, port),
        }
    }
}

/// Open `locator` on the loop's executor and connect a new protocol to it.
///
/// `factory` runs once the device is open. The returned protocol's
/// `connection_made` fires on a later loop iteration.
pub async fn create_serial_connection<P, F>(
    event_loop: Rc<dyn EventLoop>,
    factory: F,
    locator: &str,
    port_config: &PortConfiguration,
) -> Result<(SerialTransport, Rc<P>), TransportError>
where
    P: Protocol + 'static,
    F: FnOnce() -> Rc<P>,
{
    create_serial_connection_with_config(event_loop, factory, locator, port_config, &TransportConfig::default())
        .await
}

/// [`create_serial_connection`] with explicit transport settings.
pub async fn create_serial_connection_with_config<P, F>(
    event_loop: Rc<dyn EventLoop>,
    factory: F,
    locator: &str,
    port_config: &PortConfiguration,
    transport_config: &TransportConfig,
) -> Result<(SerialTransport, Rc<P>), TransportError>
where
    P: Protocol + 'static,
    F: FnOnce() -> Rc<P>,
{
    let locator: Locator = locator.parse()?;
    debug!(locator = %locator, baud = port_config.baud_rate, "Opening device");

    let port_config = port_config.clone();
    let device = run_blocking(&*event_loop, move || locator.open(&port_config)).await??;

    connection_for_device_with_config(event_loop, factory, device, transport_config)
}

/// Connect a new protocol to an already open device.
pub fn connection_for_device<P, F>(
    event_loop: Rc<dyn EventLoop>,
    factory: F,
    device: Box<dyn Device>,
) -> Result<(SerialTransport, Rc<P>), TransportError>
where
    P: Protocol + 'static,
    F: FnOnce() -> Rc<P>,
{
    connection_for_device_with_config(event_loop, factory, device, &TransportConfig::default())
}

/// [`connection_for_device`] with explicit transport settings.
pub fn connection_for_device_with_config<P, F>(
    event_loop: Rc<dyn EventLoop>,
    factory: F,
    device: Box<dyn Device>,
    transport_config: &TransportConfig,
) -> Result<(SerialTransport, Rc<P>), TransportError>
where
    P: Protocol + 'static,
    F: FnOnce() -> Rc<P>,
{
    let protocol = factory();
    let transport = SerialTransport::with_config(event_loop, protocol.clone(), device, transport_config)?;
    Ok((transport, protocol))
}
