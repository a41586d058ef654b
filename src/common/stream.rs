//! Stream abstraction
//!
//! Unified stream type for the client-facing listener and the upstream
//! connections. Sessions and the upstream client never see raw TCP sockets.

use tokio::io::{AsyncRead, AsyncWrite};

/// The core stream type used throughout the application.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_duplex_into_stream() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client.into_stream();
        let mut server = server.into_stream();

        client.write_all(b"HELLO\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO\r\n");
    }
}
