use std::{
    io::{self, Write as _},
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs as _, UdpSocket},
    sync::Arc,
    time::Duration,
};

#[cfg(target_os = "linux")]
use std::os::unix::net::UnixStream;
#[cfg(target_os = "linux")]
use std::path::{Path, PathBuf};

use tracing::{error, trace};

use crate::telemetry::Telemetry;

/// Address of the local collector that payloads are forwarded to.
#[derive(Clone, Debug)]
pub(crate) enum RemoteAddr {
    Udp {
        host: String,
        port: u16,
        addrs: Vec<SocketAddr>,
    },

    #[cfg(target_os = "linux")]
    Unix(PathBuf),
}

impl RemoteAddr {
    /// Returns the transport ID for the remote address.
    ///
    /// This is a simple acronym related to the transport that will be used for the remote address, such as `udp` for
    /// UDP, and so on.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Udp { .. } => "udp",
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => "uds",
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            RemoteAddr::Udp { host, .. } => Some(host),
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            RemoteAddr::Udp { port, .. } => Some(*port),
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => None,
        }
    }

    #[cfg(target_os = "linux")]
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            RemoteAddr::Udp { .. } => None,
            RemoteAddr::Unix(path) => Some(path),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn socket_path(&self) -> Option<&std::path::Path> {
        match self {
            RemoteAddr::Udp { .. } => None,
        }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        #[cfg(target_os = "linux")]
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                "unix" => Ok(RemoteAddr::Unix(PathBuf::from(path))),
                _ => Err(format!("invalid scheme '{}' (expected 'unix')", scheme)),
            };
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in '{}'", addr))?;
        let port: u16 = port.parse().map_err(|_| format!("invalid port in '{}'", addr))?;

        match addr.to_socket_addrs() {
            Ok(addrs) => Ok(RemoteAddr::Udp {
                host: host.trim_matches(['[', ']']).to_string(),
                port,
                addrs: addrs.collect(),
            }),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Transport configuration.
#[derive(Clone)]
pub(crate) struct TransportConfig {
    pub remote_addr: RemoteAddr,
    pub write_timeout: Duration,
}

enum Client {
    Udp(UdpSocket),

    #[cfg(target_os = "linux")]
    Unix(UnixStream),

    #[cfg(test)]
    Capture(Arc<parking_lot::Mutex<Vec<Vec<u8>>>>),
}

impl Client {
    fn from_transport_config(config: &TransportConfig) -> io::Result<Self> {
        match &config.remote_addr {
            RemoteAddr::Udp { addrs, .. } => {
                UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|socket| {
                    socket.connect(&addrs[..])?;
                    socket.set_write_timeout(Some(config.write_timeout))?;
                    Ok(Client::Udp(socket))
                })
            }

            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(path) => UnixStream::connect(path).and_then(|socket| {
                socket.set_write_timeout(Some(config.write_timeout))?;
                Ok(Client::Unix(socket))
            }),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Client::Udp(socket) => socket.send(buf),

            #[cfg(target_os = "linux")]
            Client::Unix(socket) => match socket.write_all(buf) {
                Ok(_) => Ok(buf.len()),
                Err(e) => Err(e),
            },

            #[cfg(test)]
            Client::Capture(writes) => {
                writes.lock().push(buf.to_vec());
                Ok(buf.len())
            }
        }
    }
}

enum ClientState {
    // Intermediate state during send attempts.
    Inconsistent,

    // Transport is currently disconnected.
    Disconnected(TransportConfig),

    // Transport is connected and ready to send payloads.
    Ready(TransportConfig, Client),
}

impl ClientState {
    fn try_send(&mut self, payload: &[u8]) -> io::Result<usize> {
        loop {
            let old_state = std::mem::replace(self, ClientState::Inconsistent);
            match old_state {
                ClientState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
                ClientState::Disconnected(config) => {
                    match Client::from_transport_config(&config) {
                        Ok(client) => *self = ClientState::Ready(config, client),
                        Err(e) => {
                            *self = ClientState::Disconnected(config);
                            return Err(e);
                        }
                    }
                }
                ClientState::Ready(config, mut client) => {
                    let result = client.send(payload);
                    if result.is_ok() {
                        *self = ClientState::Ready(config, client);
                    } else {
                        *self = ClientState::Disconnected(config);
                    }

                    return result;
                }
            };
        }
    }

    fn disconnect(&mut self) {
        let old_state = std::mem::replace(self, ClientState::Inconsistent);
        *self = match old_state {
            ClientState::Inconsistent => unreachable!("transitioned _from_ inconsistent state"),
            ClientState::Disconnected(config) => ClientState::Disconnected(config),
            ClientState::Ready(config, client) => {
                drop(client);
                ClientState::Disconnected(config)
            }
        };
    }
}

/// Best-effort datagram/stream transport towards the local collector.
///
/// The underlying socket is opened lazily on first write and reopened transparently on the write after a failure.
/// Write failures are contained here: they are logged and counted against telemetry, never surfaced to the caller,
/// since losing a payload is an expected outcome on these transports.
pub(crate) struct Transport {
    client_state: ClientState,
    remote_addr: RemoteAddr,
    telemetry: Option<Arc<Telemetry>>,
}

impl Transport {
    /// Create a new `Transport`.
    pub fn new(config: TransportConfig, telemetry: Option<Arc<Telemetry>>) -> Self {
        Transport {
            remote_addr: config.remote_addr.clone(),
            client_state: ClientState::Disconnected(config),
            telemetry,
        }
    }

    /// Creates a `Transport` that captures every written payload in memory.
    #[cfg(test)]
    pub fn capture(
        telemetry: Option<Arc<Telemetry>>,
    ) -> (Self, Arc<parking_lot::Mutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let remote_addr = RemoteAddr::try_from("127.0.0.1:0").unwrap();
        let config =
            TransportConfig { remote_addr: remote_addr.clone(), write_timeout: Duration::from_secs(1) };
        let transport = Transport {
            client_state: ClientState::Ready(config, Client::Capture(Arc::clone(&writes))),
            remote_addr,
            telemetry,
        };
        (transport, writes)
    }

    /// Writes a single payload to the remote collector.
    ///
    /// Best-effort: the outcome is recorded against telemetry and the log sink only.
    pub fn write(&mut self, payload: &[u8]) {
        match self.client_state.try_send(payload) {
            Ok(_) => {
                trace!(len = payload.len(), "Sent payload.");
                if let Some(telemetry) = &self.telemetry {
                    telemetry.track_packet_sent(payload.len());
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    transport = self.remote_addr.transport_id(),
                    "Failed to send payload."
                );
                if let Some(telemetry) = &self.telemetry {
                    telemetry.track_packet_dropped(payload.len());
                }
            }
        }
    }

    /// Closes the underlying socket, if open.
    ///
    /// A subsequent write reopens it.
    pub fn close(&mut self) {
        self.client_state.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{RemoteAddr, Transport, TransportConfig};
    use crate::telemetry::Telemetry;

    fn quiet_telemetry() -> Arc<Telemetry> {
        Arc::new(Telemetry::new(Duration::from_secs(3600), "udp", &[]))
    }

    fn udp_transport(server: &UdpSocket, telemetry: Option<Arc<Telemetry>>) -> Transport {
        let addr = server.local_addr().unwrap();
        let remote_addr = RemoteAddr::try_from(addr.to_string().as_str()).unwrap();
        Transport::new(
            TransportConfig { remote_addr, write_timeout: Duration::from_secs(1) },
            telemetry,
        )
    }

    #[test]
    fn parse_udp_address() {
        let addr = RemoteAddr::try_from("127.0.0.1:8125").unwrap();
        assert_eq!(addr.transport_id(), "udp");
        assert_eq!(addr.host(), Some("127.0.0.1"));
        assert_eq!(addr.port(), Some(8125));
        assert!(addr.socket_path().is_none());
    }

    #[test]
    fn parse_invalid_address() {
        assert!(RemoteAddr::try_from("not-an-address").is_err());
        assert!(RemoteAddr::try_from("127.0.0.1:notaport").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_unix_address() {
        let addr = RemoteAddr::try_from("unix:///tmp/statsd.sock").unwrap();
        assert_eq!(addr.transport_id(), "uds");
        assert!(addr.host().is_none());
        assert!(addr.port().is_none());
        assert_eq!(addr.socket_path().unwrap().to_str(), Some("/tmp/statsd.sock"));

        assert!(RemoteAddr::try_from("bogus:///tmp/statsd.sock").is_err());
    }

    #[test]
    fn write_delivers_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let telemetry = quiet_telemetry();
        let mut transport = udp_transport(&server, Some(Arc::clone(&telemetry)));
        transport.write(b"page.views:1|c\n");

        let mut buf = [0; 8192];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"page.views:1|c\n");

        assert_eq!(telemetry.packets_sent(), 1);
        assert_eq!(telemetry.packets_dropped(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn write_failure_contained_then_reopens() {
        use std::io::Read as _;
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statsd.sock");

        let telemetry = Arc::new(Telemetry::new(Duration::from_secs(3600), "uds", &[]));
        let remote_addr = RemoteAddr::try_from(format!("unix://{}", path.display()).as_str()).unwrap();
        let mut transport = Transport::new(
            TransportConfig { remote_addr, write_timeout: Duration::from_secs(1) },
            Some(Arc::clone(&telemetry)),
        );

        // Nothing is listening yet, so the write is silently lost.
        transport.write(b"page.views:1|c\n");
        assert_eq!(telemetry.packets_dropped(), 1);

        // Once a listener shows up, the next write connects and goes through.
        let listener = UnixListener::bind(&path).unwrap();
        transport.write(b"page.views:2|c\n");
        assert_eq!(telemetry.packets_sent(), 1);

        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0; 8192];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"page.views:2|c\n");
    }
}
