//! Addressing and link establishment for OBEX sessions.

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Default TCP port of OBEX over IP.
pub const OBEX_TCP_PORT: u16 = 650;

/// A byte stream an OBEX session runs over.
pub trait ObexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ObexStream for T {}

/// Where an OBEX peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObexAddress {
    /// Bluetooth device, optionally with a known RFCOMM channel.
    Bluetooth {
        /// Device address, `AA:BB:CC:DD:EE:FF`.
        address: String,
        /// RFCOMM channel; discovered via SDP if missing.
        channel: Option<u8>,
    },
    /// OBEX over TCP.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl ObexAddress {
    /// Parses `obex-bt://AA:BB:CC:DD:EE:FF[+channel]` or
    /// `obex-tcp://host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for anything else.
    pub fn parse(url: &str) -> TransportResult<Self> {
        if let Some(rest) = strip_scheme(url, "obex-bt://") {
            let (address, channel) = match rest.split_once('+') {
                Some((address, channel)) => {
                    let channel = channel
                        .parse::<u8>()
                        .ok()
                        .filter(|c| (1..=30).contains(c))
                        .ok_or_else(|| TransportError::invalid_url(url, "invalid RFCOMM channel"))?;
                    (address, Some(channel))
                }
                None => (rest, None),
            };
            if !is_bluetooth_address(address) {
                return Err(TransportError::invalid_url(url, "invalid Bluetooth address"));
            }
            return Ok(ObexAddress::Bluetooth {
                address: address.to_ascii_uppercase(),
                channel,
            });
        }

        if let Some(rest) = strip_scheme(url, "obex-tcp://") {
            let rest = rest.trim_end_matches('/');
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| TransportError::invalid_url(url, "invalid port"))?;
                    (host, port)
                }
                _ => (rest, OBEX_TCP_PORT),
            };
            if host.is_empty() {
                return Err(TransportError::invalid_url(url, "missing host"));
            }
            return Ok(ObexAddress::Tcp {
                host: host.to_string(),
                port,
            });
        }

        Err(TransportError::invalid_url(
            url,
            "expected obex-bt:// or obex-tcp://",
        ))
    }

    /// Returns true if a service discovery is needed before connecting.
    pub fn needs_discovery(&self) -> bool {
        matches!(self, ObexAddress::Bluetooth { channel: None, .. })
    }
}

impl fmt::Display for ObexAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObexAddress::Bluetooth {
                address,
                channel: Some(channel),
            } => write!(f, "obex-bt://{address}+{channel}"),
            ObexAddress::Bluetooth { address, channel: None } => write!(f, "obex-bt://{address}"),
            ObexAddress::Tcp { host, port } => write!(f, "obex-tcp://{host}:{port}"),
        }
    }
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    let head = url.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme).then(|| &url[scheme.len()..])
}

fn is_bluetooth_address(address: &str) -> bool {
    let parts: Vec<&str> = address.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|part| part.len() == 2 && part.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Looks up the RFCOMM channel of the SyncML service on a Bluetooth device.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Returns the channel of the SyncML client service on `address`.
    async fn discover_channel(&self, address: &str) -> TransportResult<u8>;
}

/// Discovery for platforms without Bluetooth support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoServiceDiscovery;

#[async_trait]
impl ServiceDiscovery for NoServiceDiscovery {
    async fn discover_channel(&self, address: &str) -> TransportResult<u8> {
        Err(TransportError::Discovery(format!(
            "no Bluetooth service discovery available for {address}, give the channel explicitly"
        )))
    }
}

/// Opens the byte stream to a resolved peer.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Connects to `address`. For Bluetooth, `channel` is the resolved
    /// RFCOMM channel.
    async fn connect(
        &self,
        address: &ObexAddress,
        channel: Option<u8>,
    ) -> TransportResult<Box<dyn ObexStream>>;
}

/// Connects OBEX-over-TCP peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl LinkConnector for TcpConnector {
    async fn connect(
        &self,
        address: &ObexAddress,
        _channel: Option<u8>,
    ) -> TransportResult<Box<dyn ObexStream>> {
        let ObexAddress::Tcp { host, port } = address else {
            return Err(TransportError::Connect(format!(
                "{address}: no Bluetooth link connector configured"
            )));
        };

        let stream = TcpStream::connect((host.as_str(), *port))
            .await
            .map_err(|err| TransportError::Connect(format!("{address}: {err}")))?;
        // A pending socket error means the connect did not really succeed
        if let Some(err) = stream.take_error()? {
            return Err(TransportError::Connect(format!("{address}: {err}")));
        }
        stream.set_nodelay(true)?;
        debug!(%address, "TCP link established");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bluetooth_urls() {
        assert_eq!(
            ObexAddress::parse("obex-bt://00:0a:95:9d:68:16").unwrap(),
            ObexAddress::Bluetooth {
                address: "00:0A:95:9D:68:16".into(),
                channel: None
            }
        );
        let address = ObexAddress::parse("OBEX-BT://00:0A:95:9D:68:16+7").unwrap();
        assert_eq!(
            address,
            ObexAddress::Bluetooth {
                address: "00:0A:95:9D:68:16".into(),
                channel: Some(7)
            }
        );
        assert!(!address.needs_discovery());
        assert_eq!(address.to_string(), "obex-bt://00:0A:95:9D:68:16+7");

        assert!(ObexAddress::parse("obex-bt://00:0A:95:9D:68").is_err());
        assert!(ObexAddress::parse("obex-bt://00:0A:95:9D:68:16+0").is_err());
        assert!(ObexAddress::parse("obex-bt://00:0A:95:9D:68:16+x").is_err());
    }

    #[test]
    fn parse_tcp_urls() {
        assert_eq!(
            ObexAddress::parse("obex-tcp://phone.local").unwrap(),
            ObexAddress::Tcp {
                host: "phone.local".into(),
                port: OBEX_TCP_PORT
            }
        );
        assert_eq!(
            ObexAddress::parse("obex-tcp://127.0.0.1:6500/").unwrap(),
            ObexAddress::Tcp {
                host: "127.0.0.1".into(),
                port: 6500
            }
        );
        assert!(ObexAddress::parse("obex-tcp://").is_err());
        assert!(ObexAddress::parse("obex-tcp://host:http").is_err());
        assert!(ObexAddress::parse("http://example.com").is_err());
    }

    #[tokio::test]
    async fn tcp_connector_refuses_bluetooth() {
        let address = ObexAddress::parse("obex-bt://00:0A:95:9D:68:16+1").unwrap();
        let result = TcpConnector.connect(&address, Some(1)).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn no_discovery_fails() {
        let result = NoServiceDiscovery.discover_channel("00:0A:95:9D:68:16").await;
        assert!(matches!(result, Err(TransportError::Discovery(_))));
    }

    #[tokio::test]
    async fn tcp_connect_refused() {
        // Bind and drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let address = ObexAddress::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let result = TcpConnector.connect(&address, None).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
