//! Raw TCP transport (for testing and internal networks)
//!
//! Frames are written back to back on the byte stream and recovered with
//! [`FrameCodec`].

use super::{
    Connector, Endpoint, FrameSink, FrameSource, FrameTransport, TransportConfig, TransportError,
};
use crate::tunnel::{Frame, FrameCodec, TunnelError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

fn codec_error(err: TunnelError) -> TransportError {
    match err {
        TunnelError::Io(e) => TransportError::Io(e),
        other => TransportError::Malformed(other),
    }
}

struct CodecSink<S> {
    inner: FramedWrite<WriteHalf<S>, FrameCodec>,
}

#[async_trait]
impl<S> FrameSink for CodecSink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(frame).await.map_err(codec_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(codec_error)
    }
}

struct CodecSource<S> {
    inner: FramedRead<ReadHalf<S>, FrameCodec>,
}

#[async_trait]
impl<S> FrameSource for CodecSource<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        self.inner.next().await.transpose().map_err(codec_error)
    }
}

/// Run the frame protocol directly over a byte stream
pub fn framed<S>(io: S, max_frame_size: usize) -> FrameTransport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    FrameTransport::new(
        CodecSink {
            inner: FramedWrite::new(writer, FrameCodec::new(max_frame_size)),
        },
        CodecSource {
            inner: FramedRead::new(reader, FrameCodec::new(max_frame_size)),
        },
    )
}

/// Connector for `tcp://host:port` endpoints
pub struct TcpConnector {
    endpoint: Endpoint,
    config: TransportConfig,
}

impl TcpConnector {
    /// Create a new TCP connector
    pub fn new(endpoint: Endpoint, config: TransportConfig) -> Self {
        Self { endpoint, config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<FrameTransport, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }

        Ok(framed(stream, self.config.max_frame_size))
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}
