//! SOCKS5 ingress (RFC 1928), CONNECT only, no authentication

use super::{Address, AddressType, ProxyError};
use crate::protocol::ErrorReason;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<ErrorReason> for Reply {
    fn from(reason: ErrorReason) -> Self {
        match reason {
            ErrorReason::ConnectionRefused => Reply::ConnectionRefused,
            ErrorReason::HostUnreachable
            | ErrorReason::TimedOut
            | ErrorReason::InvalidDestination => Reply::HostUnreachable,
            ErrorReason::NetworkUnreachable => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Where a SOCKS5 connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    /// Waiting for the method negotiation
    AwaitGreeting,
    /// Waiting for the request, or for its reply to be sent
    AwaitRequest,
    /// Reply sent with success; bytes are relayed verbatim
    Relaying,
    /// Connection is finished
    Closed,
}

/// One accepted SOCKS5 connection
pub struct Socks5Conn<S> {
    stream: S,
    state: Socks5State,
    destination: Option<Address>,
}

impl<S> Socks5Conn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: Socks5State::AwaitGreeting,
            destination: None,
        }
    }

    pub fn state(&self) -> Socks5State {
        self.state
    }

    /// Destination requested by the client, once read
    pub fn destination(&self) -> Option<&Address> {
        self.destination.as_ref()
    }

    /// Run the greeting and request phases, returning the CONNECT target.
    ///
    /// Protocol violations are answered where SOCKS5 defines a reply and
    /// leave the connection `Closed`.
    pub async fn handshake(&mut self) -> Result<Address, ProxyError> {
        self.negotiate().await?;
        self.read_request().await
    }

    async fn negotiate(&mut self) -> Result<(), ProxyError> {
        self.expect_state(Socks5State::AwaitGreeting)?;

        let mut buf = [0u8; 255];
        let result = async {
            self.stream.read_exact(&mut buf[..2]).await?;
            if buf[0] != SOCKS_VERSION {
                return Err(ProxyError::InvalidSocksVersion(buf[0]));
            }

            let nmethods = buf[1] as usize;
            self.stream.read_exact(&mut buf[..nmethods]).await?;

            let method = if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
                AuthMethod::NoAuth
            } else {
                AuthMethod::NoAcceptable
            };

            self.stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
            if method == AuthMethod::NoAcceptable {
                return Err(ProxyError::NoAcceptableMethod);
            }
            Ok(())
        }
        .await;

        self.state = match result {
            Ok(()) => Socks5State::AwaitRequest,
            Err(_) => Socks5State::Closed,
        };
        result
    }

    async fn read_request(&mut self) -> Result<Address, ProxyError> {
        self.expect_state(Socks5State::AwaitRequest)?;

        let mut header = [0u8; 4];
        if let Err(e) = self.stream.read_exact(&mut header).await {
            self.state = Socks5State::Closed;
            return Err(e.into());
        }

        if header[0] != SOCKS_VERSION {
            self.state = Socks5State::Closed;
            return Err(ProxyError::InvalidSocksVersion(header[0]));
        }

        // header[2] is reserved
        let command = match Command::try_from(header[1]) {
            Ok(Command::Connect) => Command::Connect,
            Ok(other) => {
                debug!("Rejecting SOCKS5 command {:?}", other);
                let error = ProxyError::UnsupportedCommand(other as u8);
                return self.fail(Reply::CommandNotSupported, error).await;
            }
            Err(e) => return self.fail(Reply::CommandNotSupported, e).await,
        };

        let addr_type = match AddressType::try_from(header[3]) {
            Ok(t) => t,
            Err(e) => return self.fail(Reply::AddressTypeNotSupported, e).await,
        };

        let address = match self.read_address(addr_type).await {
            Ok(address) => address,
            Err(e) => {
                self.state = Socks5State::Closed;
                return Err(e);
            }
        };

        debug!("SOCKS5 {:?} to {}", command, address);
        self.destination = Some(address.clone());
        Ok(address)
    }

    async fn read_address(&mut self, addr_type: AddressType) -> Result<Address, ProxyError> {
        let address = match addr_type {
            AddressType::Ipv4 => {
                let mut ip = [0u8; 4];
                self.stream.read_exact(&mut ip).await?;
                Address::Ipv4(ip, self.stream.read_u16().await?)
            }
            AddressType::Domain => {
                let len = self.stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                self.stream.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| ProxyError::InvalidAddress("domain is not UTF-8".to_string()))?;
                Address::Domain(domain, self.stream.read_u16().await?)
            }
            AddressType::Ipv6 => {
                let mut ip = [0u8; 16];
                self.stream.read_exact(&mut ip).await?;
                Address::Ipv6(ip, self.stream.read_u16().await?)
            }
        };
        Ok(address)
    }

    /// Report success and hand back the socket for relaying
    pub async fn accept(mut self) -> Result<S, ProxyError> {
        self.expect_state(Socks5State::AwaitRequest)?;
        if self.destination.is_none() {
            return Err(ProxyError::InvalidState(self.state));
        }
        self.send_reply(Reply::Succeeded).await?;
        self.state = Socks5State::Relaying;
        Ok(self.stream)
    }

    /// Report failure and close the connection
    pub async fn reject(mut self, reply: Reply) -> Result<(), ProxyError> {
        self.expect_state(Socks5State::AwaitRequest)?;
        self.send_reply(reply).await?;
        self.state = Socks5State::Closed;
        self.stream.shutdown().await.ok();
        Ok(())
    }

    async fn fail<T>(&mut self, reply: Reply, error: ProxyError) -> Result<T, ProxyError> {
        self.send_reply(reply).await.ok();
        self.state = Socks5State::Closed;
        Err(error)
    }

    /// Replies always carry the unspecified bound address `0.0.0.0:0`
    async fn send_reply(&mut self, reply: Reply) -> Result<(), ProxyError> {
        let buf = [SOCKS_VERSION, reply as u8, 0x00, AddressType::Ipv4 as u8, 0, 0, 0, 0, 0, 0];
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn expect_state(&self, expected: Socks5State) -> Result<(), ProxyError> {
        if self.state != expected {
            return Err(ProxyError::InvalidState(self.state));
        }
        Ok(())
    }
}

/// SOCKS5 listener
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind the SOCKS5 listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next client connection
    pub async fn accept(&self) -> Result<(Socks5Conn<TcpStream>, SocketAddr), ProxyError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        debug!("New SOCKS5 connection from {}", peer_addr);
        Ok((Socks5Conn::new(stream), peer_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn greet(client: &mut DuplexStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00]);
    }

    async fn read_reply(client: &mut DuplexStream) -> [u8; 10] {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (mut client, server) = duplex(1024);
        let mut conn = Socks5Conn::new(server);

        let handshake = tokio::spawn(async move {
            let dest = conn.handshake().await.unwrap();
            (conn, dest)
        });

        greet(&mut client).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB])
            .await
            .unwrap();

        let (conn, dest) = handshake.await.unwrap();
        assert_eq!(dest, Address::Ipv4([93, 184, 216, 34], 443));
        assert_eq!(conn.state(), Socks5State::AwaitRequest);

        let mut stream = conn.accept().await.unwrap();
        assert_eq!(
            read_reply(&mut client).await,
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );

        // Relaying: bytes pass straight through
        client.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(async move { Socks5Conn::new(server).handshake().await });

        greet(&mut client).await;
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let dest = handshake.await.unwrap().unwrap();
        assert_eq!(dest, Address::Domain("example.com".to_string(), 80));
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(async move {
            let mut conn = Socks5Conn::new(server);
            let result = conn.handshake().await;
            (conn.state(), result)
        });

        // Only username/password offered
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0xFF]);

        let (state, result) = handshake.await.unwrap();
        assert_eq!(state, Socks5State::Closed);
        assert!(matches!(result, Err(ProxyError::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn test_wrong_version_closes() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(async move { Socks5Conn::new(server).handshake().await });

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(matches!(
            handshake.await.unwrap(),
            Err(ProxyError::InvalidSocksVersion(0x04))
        ));
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(async move { Socks5Conn::new(server).handshake().await });

        greet(&mut client).await;
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        assert_eq!(read_reply(&mut client).await[1], 0x07);
        assert!(matches!(
            handshake.await.unwrap(),
            Err(ProxyError::UnsupportedCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(async move { Socks5Conn::new(server).handshake().await });

        greet(&mut client).await;
        client.write_all(&[0x05, 0x01, 0x00, 0x05]).await.unwrap();

        assert_eq!(read_reply(&mut client).await[1], 0x08);
        assert!(matches!(
            handshake.await.unwrap(),
            Err(ProxyError::UnsupportedAddressType(0x05))
        ));
    }

    #[tokio::test]
    async fn test_reject_sends_reply_code() {
        let (mut client, server) = duplex(1024);
        let handshake = tokio::spawn(async move {
            let mut conn = Socks5Conn::new(server);
            conn.handshake().await.unwrap();
            conn.reject(Reply::from(ErrorReason::ConnectionRefused))
                .await
                .unwrap();
        });

        greet(&mut client).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 1])
            .await
            .unwrap();

        assert_eq!(
            read_reply(&mut client).await,
            [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        handshake.await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_accept_before_request_is_invalid() {
        let (_client, server) = duplex(64);
        let conn = Socks5Conn::new(server);
        assert!(matches!(
            conn.accept().await,
            Err(ProxyError::InvalidState(Socks5State::AwaitGreeting))
        ));
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(
            Reply::from(ErrorReason::ConnectionRefused),
            Reply::ConnectionRefused
        );
        assert_eq!(Reply::from(ErrorReason::HostUnreachable), Reply::HostUnreachable);
        assert_eq!(Reply::from(ErrorReason::TimedOut), Reply::HostUnreachable);
        assert_eq!(
            Reply::from(ErrorReason::NetworkUnreachable),
            Reply::NetworkUnreachable
        );
        assert_eq!(Reply::from(ErrorReason::TooManyStreams), Reply::GeneralFailure);
        assert_eq!(
            Reply::from(ErrorReason::TunnelReconnected),
            Reply::GeneralFailure
        );
    }
}
