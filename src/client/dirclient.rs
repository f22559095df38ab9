//! Client-side stub asking the directory service where the principal is.

use std::net::{IpAddr, SocketAddr};

use crate::protocol::{parse_opt_addr, Envelope, MsgType};
use crate::utils::{
    udp_bind, udp_recv_envelope, udp_send_envelope, RendezvousError,
};

use tokio::net::UdpSocket;
use tokio::time::{self, Duration, Instant};

/// Directory service lookup stub.
pub struct DirectoryClient {
    /// Directory service address.
    directory: SocketAddr,

    /// Ephemeral socket requests are sent from and replies arrive at.
    socket: UdpSocket,
}

impl DirectoryClient {
    /// Creates a stub bound to an ephemeral port on `bind_ip`.
    pub async fn new_and_setup(
        bind_ip: IpAddr,
        directory: SocketAddr,
    ) -> Result<Self, RendezvousError> {
        let socket = udp_bind(SocketAddr::new(bind_ip, 0)).await?;
        Ok(DirectoryClient { directory, socket })
    }

    /// Asks the directory for the principal's client-facing address.
    /// Returns `Ok(None)` if there is currently no principal, and an error
    /// if no answer arrives within `timeout`.
    pub async fn query_principal(
        &self,
        timeout: Duration,
    ) -> Result<Option<SocketAddr>, RendezvousError> {
        let request = Envelope::client_request();
        udp_send_envelope(&self.socket, &request, self.directory).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let (source, reply) =
                time::timeout_at(deadline, udp_recv_envelope(&self.socket))
                    .await??;
            match reply {
                Ok(reply) if reply.msg_type() == Some(MsgType::DsResponse) => {
                    let principal = parse_opt_addr(reply.content())?;
                    pf_debug!("directory says principal is {:?}", principal);
                    return Ok(principal);
                }
                Ok(other) => pf_debug!("ignoring {} from '{}'", other, source),
                Err(e) => {
                    pf_debug!("undecodable reply from '{}': {}", source, e)
                }
            }
        }
    }
}

#[cfg(test)]
mod dirclient_tests {
    use super::*;
    use crate::directory::DirectoryService;
    use crate::protocol::RegisterContent;
    use std::net::Ipv4Addr;
    use tokio::sync::watch;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn query_empty_then_principal() -> Result<(), RendezvousError> {
        let ds =
            DirectoryService::new_and_setup("127.0.0.1:0".parse()?, None)
                .await?;
        let ds_addr = ds.local_addr()?;
        let (_tx_term, rx_term) = watch::channel(false);
        tokio::spawn(ds.run(rx_term));

        let client =
            DirectoryClient::new_and_setup(Ipv4Addr::LOCALHOST.into(), ds_addr)
                .await?;
        assert_eq!(client.query_principal(Duration::from_secs(2)).await?, None);

        let worker = udp_bind("127.0.0.1:0".parse()?).await?;
        udp_send_envelope(
            &worker,
            &Envelope::server_register(&RegisterContent {
                client_addr: "127.0.0.1:5000".parse()?,
                copy_addr: "127.0.0.1:47000".parse()?,
            }),
            ds_addr,
        )
        .await?;
        let principal = time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(addr) =
                    client.query_principal(Duration::from_secs(1)).await?
                {
                    return Ok::<_, RendezvousError>(addr);
                }
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await??;
        assert_eq!(principal, "127.0.0.1:5000".parse::<SocketAddr>()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn query_times_out() -> Result<(), RendezvousError> {
        let silent = udp_bind("127.0.0.1:0".parse()?).await?;
        let client = DirectoryClient::new_and_setup(
            Ipv4Addr::LOCALHOST.into(),
            silent.local_addr()?,
        )
        .await?;
        assert!(client
            .query_principal(Duration::from_millis(100))
            .await
            .is_err());
        Ok(())
    }
}
