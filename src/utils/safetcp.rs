//! Length-framed TCP helpers plus bind/connect with retrying.

use std::net::SocketAddr;

use crate::protocol::Envelope;
use crate::utils::RendezvousError;

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Upper bound on the body of a frame that carries an envelope.
const MAX_ENVELOPE_FRAME: usize = 64 * 1024;

/// Writes one frame: an 8-byte big-endian body length followed by the body.
pub(crate) async fn tcp_write_frame<Conn>(
    conn_write: &mut Conn,
    body: &[u8],
) -> Result<(), RendezvousError>
where
    Conn: AsyncWrite + Unpin,
{
    conn_write.write_u64(body.len() as u64).await?;
    conn_write.write_all(body).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Reads one frame written by `tcp_write_frame()`, refusing bodies longer
/// than `max_len`. A connection closed before the whole body arrived is an
/// error, so a truncated frame is never returned.
///
/// NOT cancellation-safe: if dropped midway, the connection must be dropped
/// as well.
pub(crate) async fn tcp_read_frame<Conn>(
    conn_read: &mut Conn,
    max_len: usize,
) -> Result<Bytes, RendezvousError>
where
    Conn: AsyncRead + Unpin,
{
    let body_len = conn_read.read_u64().await?;
    if body_len > max_len as u64 {
        return Err(RendezvousError::msg(format!(
            "frame length {} exceeds limit {}",
            body_len, max_len
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut body = BytesMut::zeroed(body_len as usize);
    conn_read.read_exact(&mut body[..]).await?;
    Ok(body.freeze())
}

/// Writes an envelope as one frame.
pub(crate) async fn tcp_write_envelope<Conn>(
    conn_write: &mut Conn,
    env: &Envelope,
) -> Result<(), RendezvousError>
where
    Conn: AsyncWrite + Unpin,
{
    tcp_write_frame(conn_write, &env.encode()?).await
}

/// Reads one frame and decodes it as an envelope.
pub(crate) async fn tcp_read_envelope<Conn>(
    conn_read: &mut Conn,
) -> Result<Envelope, RendezvousError>
where
    Conn: AsyncRead + Unpin,
{
    let body = tcp_read_frame(conn_read, MAX_ENVELOPE_FRAME).await?;
    Envelope::decode(&body)
}

/// Creates a fresh TCP socket of the right family for `addr`.
fn new_socket_for(addr: &SocketAddr) -> Result<TcpSocket, RendezvousError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    Ok(socket)
}

/// Wrapper over binding a `TcpListener` that retries on failure. Port `0`
/// binds an ephemeral port.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, RendezvousError> {
    loop {
        let socket = new_socket_for(&bind_addr)?;
        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return logged_err!(
                        "binding TCP listener '{}' failed: {}",
                        bind_addr,
                        err
                    );
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over `TcpStream::connect()` that retries on failure, waiting
/// `backoff` between attempts.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
    backoff: Duration,
) -> Result<TcpStream, RendezvousError> {
    loop {
        let socket = new_socket_for(&conn_addr)?;
        match socket.connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_over_loopback() -> Result<(), RendezvousError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await?;
            let req = tcp_read_envelope(&mut conn).await?;
            assert_eq!(req, Envelope::db_copy_request());
            tcp_write_envelope(&mut conn, &Envelope::db_copy_start(42)).await?;
            tcp_write_frame(&mut conn, b"snapshot bytes").await?;
            Ok::<(), RendezvousError>(())
        });

        let mut conn =
            tcp_connect_with_retry(addr, 3, Duration::from_millis(100)).await?;
        tcp_write_envelope(&mut conn, &Envelope::db_copy_request()).await?;
        assert_eq!(
            tcp_read_envelope(&mut conn).await?,
            Envelope::db_copy_start(42)
        );
        let body = tcp_read_frame(&mut conn, 1024).await?;
        assert_eq!(&body[..], b"snapshot bytes");
        server.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncated_frame_is_error() -> Result<(), RendezvousError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut conn, _)) = listener.accept().await {
                // promise 100 bytes, deliver 4, then hang up
                let _ = conn.write_u64(100).await;
                let _ = conn.write_all(b"oops").await;
            }
        });

        let mut conn =
            tcp_connect_with_retry(addr, 3, Duration::from_millis(100)).await?;
        assert!(tcp_read_frame(&mut conn, 1024).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversize_frame_is_error() -> Result<(), RendezvousError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut conn, _)) = listener.accept().await {
                let _ = tcp_write_frame(&mut conn, &[7u8; 64]).await;
            }
        });

        let mut conn =
            tcp_connect_with_retry(addr, 3, Duration::from_millis(100)).await?;
        assert!(tcp_read_frame(&mut conn, 16).await.is_err());
        Ok(())
    }
}
