//! Single-datagram envelope helpers over UDP.

use std::io;
use std::net::SocketAddr;

use crate::protocol::Envelope;
use crate::utils::RendezvousError;

use tokio::net::UdpSocket;

/// Largest datagram an envelope may occupy, in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Binds a UDP socket, port `0` meaning ephemeral.
pub(crate) async fn udp_bind(
    bind_addr: SocketAddr,
) -> Result<UdpSocket, RendezvousError> {
    match UdpSocket::bind(bind_addr).await {
        Ok(socket) => Ok(socket),
        Err(e) => logged_err!("binding UDP socket '{}' failed: {}", bind_addr, e),
    }
}

/// Sends one envelope as one datagram. Envelopes that would not fit in
/// `MAX_DATAGRAM_SIZE` bytes are refused rather than truncated.
pub(crate) async fn udp_send_envelope(
    socket: &UdpSocket,
    env: &Envelope,
    dest: SocketAddr,
) -> Result<(), RendezvousError> {
    let bytes = env.encode()?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(RendezvousError::msg(format!(
            "envelope {} of {} bytes exceeds datagram limit {}",
            env.tag(),
            bytes.len(),
            MAX_DATAGRAM_SIZE
        )));
    }

    let sent = socket.send_to(&bytes, dest).await?;
    if sent != bytes.len() {
        return Err(RendezvousError::msg(format!(
            "partial datagram to '{}': {} of {} bytes",
            dest,
            sent,
            bytes.len()
        )));
    }
    Ok(())
}

/// Receives one datagram and decodes it as an envelope. Returns the source
/// address alongside the decode result so the caller can log and move on
/// when decoding fails; only socket errors are returned as the outer `Err`.
///
/// Datagrams larger than `MAX_DATAGRAM_SIZE` are reported as decode errors.
pub(crate) async fn udp_recv_envelope(
    socket: &UdpSocket,
) -> Result<(SocketAddr, Result<Envelope, RendezvousError>), RendezvousError> {
    // one spare byte to detect oversize datagrams
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
    let (len, source) = socket.recv_from(&mut buf).await?;
    if len > MAX_DATAGRAM_SIZE {
        return Ok((
            source,
            Err(RendezvousError::msg(format!(
                "datagram from '{}' exceeds limit {}",
                source, MAX_DATAGRAM_SIZE
            ))),
        ));
    }
    Ok((source, Envelope::decode(&buf[..len])))
}

/// Discards every datagram already queued on `socket` without waiting,
/// returning how many were dropped.
pub(crate) fn udp_drain(socket: &UdpSocket) -> Result<usize, RendezvousError> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
    let mut dropped = 0;
    loop {
        match socket.try_recv_from(&mut buf) {
            Ok(_) => dropped += 1,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(dropped)
            }
            Err(e) => return Err(e.into()),
        }
    }
}
