//! Transport Layer
//!
//! Opens the byte stream to the broker, plain TCP or TLS, behind a single
//! `AsyncRead + AsyncWrite` type.

mod tls;

pub use tls::{client_connector, TlsError};

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Byte stream to the broker
pub enum MqttStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Connect to `host:port`, upgrading to TLS when a connector is given
pub async fn connect(
    host: &str,
    port: u16,
    tls: Option<&TlsConnector>,
) -> io::Result<MqttStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    debug!("TCP connected to {}:{}", host, port);

    let Some(connector) = tls else {
        return Ok(MqttStream::Tcp(stream));
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let stream = connector.connect(server_name, stream).await?;
    debug!("TLS handshake with {} complete", host);

    Ok(MqttStream::Tls(Box::new(stream)))
}

impl AsyncRead for MqttStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MqttStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            MqttStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MqttStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MqttStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            MqttStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MqttStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            MqttStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MqttStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            MqttStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
