//! TCP Transport implementation

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;

use super::{Listener, Transport};

/// TCP transport with a bounded connect time
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        let connect = async {
            match addr {
                Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
                Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
            }
        };

        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("cannot connect to {}: {}", addr, e)))?;

        stream.set_nodelay(true)?;
        Ok(stream.into_stream())
    }

    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>> {
        let listener = match addr {
            Address::Socket(s) => TcpListener::bind(s).await?,
            Address::Domain(domain, port) => TcpListener::bind((domain.as_str(), *port)).await?,
        };
        Ok(Box::new(TcpListenerWrapper { listener }))
    }
}

/// Wrapper for TcpListener to implement Listener trait
struct TcpListenerWrapper {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpListenerWrapper {
    async fn accept(&self) -> Result<(Stream, Address)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream.into_stream(), Address::Socket(addr)))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_accept() {
        let transport = TcpTransport::default();
        let listener = transport
            .bind(&Address::parse("127.0.0.1:0").unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = transport.connect(&addr).await.unwrap();
        client.write_all(b"HELLO").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let result = transport
            .connect(&Address::parse(&format!("127.0.0.1:{}", port)).unwrap())
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
