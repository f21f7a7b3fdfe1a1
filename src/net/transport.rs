//! TCP transport
//!
//! Frames are a little-endian `u16` length followed by that many bytes (opcode
//! first). Each accepted connection gets a reader loop and a writer task; the
//! world-side `Session` is handed to the game loop over a channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use super::buffer::MAX_PACKET_SIZE;
use super::session::{Session, SessionHandle, SessionId};
use crate::error::{NetworkError, Result};

/// Read one frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u16_le().await {
        Ok(length) => usize::from(length),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::ReadError(e.to_string()).into()),
    };

    if length == 0 {
        return Err(NetworkError::EmptyFrame.into());
    }

    let mut frame = vec![0u8; length];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| NetworkError::ReadError(e.to_string()))?;

    trace!(length, "Read frame");
    Ok(Some(Bytes::from(frame)))
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_PACKET_SIZE {
        return Err(NetworkError::FrameTooLarge(frame.len()).into());
    }

    // Bounded by MAX_PACKET_SIZE above
    let length = frame.len() as u16;
    writer
        .write_u16_le(length)
        .await
        .map_err(|e| NetworkError::WriteError(e.to_string()))?;
    writer
        .write_all(frame)
        .await
        .map_err(|e| NetworkError::WriteError(e.to_string()))?;

    Ok(())
}

/// Pump frames between a TCP stream and a session handle until either side
/// hangs up
pub async fn serve_connection(stream: TcpStream, handle: SessionHandle) {
    let id = handle.id;
    let address = handle.address;
    let (mut reader, mut writer) = stream.into_split();
    let (inbound, mut outbound) = handle.into_parts();

    let writer_task = tokio::spawn(async move {
        while let Some(packet) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &packet).await {
                debug!(session_id = id, error = %e, "Write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if inbound.send(frame).is_err() {
                    // World dropped the session
                    break;
                }
            }
            Ok(None) => {
                debug!(session_id = id, address = %address, "Client closed connection");
                break;
            }
            Err(e) => {
                warn!(session_id = id, address = %address, error = %e, "Connection error");
                break;
            }
        }
    }

    drop(inbound);
    let _ = writer_task.await;
    info!(session_id = id, address = %address, "Connection closed");
}

/// Accepts TCP connections and hands new sessions to the world
pub struct Listener {
    listener: TcpListener,
    next_id: AtomicU64,
}

impl Listener {
    /// Bind to an address
    pub async fn bind(address: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %address, "Game server listening");
        Ok(Self::new(listener))
    }

    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            next_id: AtomicU64::new(1),
        }
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Accept connections until shutdown
    pub async fn run(
        &self,
        connections: mpsc::UnboundedSender<Session>,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, address)) => {
                            let _ = stream.set_nodelay(true);
                            let (session, handle) = Session::pair(self.next_id(), address);
                            info!(session_id = session.id, address = %address, "New connection");

                            if connections.send(session).is_err() {
                                warn!("World is gone, refusing connection");
                                break;
                            }
                            tokio::spawn(serve_connection(stream, handle));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Connection acceptor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LatticeError;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = duplex(256);

        write_frame(&mut client, &[1, 2, 3]).await.unwrap();
        write_frame(&mut client, &[4]).await.unwrap();
        drop(client);

        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Some(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Some(Bytes::from_static(&[4]))
        );
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let (mut client, mut server) = duplex(16);
        client.write_all(&[0, 0]).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(LatticeError::Network(NetworkError::EmptyFrame))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = duplex(16);
        client.write_all(&[5, 0, 1, 2]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(LatticeError::Network(NetworkError::ReadError(_)))
        ));
    }

    #[tokio::test]
    async fn test_listener_hands_over_sessions() {
        let listener = Listener::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let address = listener.local_addr().unwrap();
        let (connections_tx, mut connections_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let acceptor = tokio::spawn(async move {
            listener.run(connections_tx, &mut shutdown_rx).await;
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        write_frame(&mut client, &[0]).await.unwrap();

        let mut session = connections_rx.recv().await.unwrap();
        assert_eq!(session.id, 1);

        // Wait for the frame to cross the reader loop
        let mut frames = Vec::new();
        while frames.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            frames = session.drain(8);
        }
        assert_eq!(frames, vec![Bytes::from_static(&[0])]);

        assert!(session.send(Bytes::from_static(&[11, 9])));
        assert_eq!(
            read_frame(&mut client).await.unwrap(),
            Some(Bytes::from_static(&[11, 9]))
        );

        shutdown_tx.send(()).unwrap();
        acceptor.await.unwrap();
    }
}
