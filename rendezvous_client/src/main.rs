//! Rendezvous client: asks the directory service which worker to talk to.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use rendezvous::{logger_init, pf_error, DirectoryClient, RendezvousError};
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the request socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Directory service address.
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    directory: SocketAddr,

    /// Milliseconds to wait for the directory's answer.
    #[arg(short, long, default_value_t = 2000)]
    timeout_ms: u64,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(RendezvousError)` on any error.
    fn sanitize(&self) -> Result<(), RendezvousError> {
        if self.directory.port() == 0 {
            Err(RendezvousError::msg(format!(
                "invalid directory address {}",
                self.directory
            )))
        } else if self.timeout_ms == 0 {
            Err(RendezvousError::msg(format!(
                "invalid timeout_ms {}",
                self.timeout_ms
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of Rendezvous client. Prints the principal's
/// client-facing address, or nothing if there is none.
fn client_main() -> Result<(), RendezvousError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let runtime = Builder::new_current_thread().enable_all().build()?;
    let principal = runtime.block_on(async move {
        let client =
            DirectoryClient::new_and_setup(args.bind_ip.into(), args.directory)
                .await?;
        client
            .query_principal(Duration::from_millis(args.timeout_ms))
            .await
    })?;

    match principal {
        Some(addr) => println!("{}", addr),
        None => {
            return Err(RendezvousError::msg("no principal available"));
        }
    }
    Ok(())
}

/// Main function of Rendezvous client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
