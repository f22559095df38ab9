//! Rendezvous worker server executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use rendezvous::{
    logger_init, pf_error, pf_info, LoggingSession, RendezvousError,
    WorkerNode, ME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets. If unspecified,
    /// the IP used to reach the directory service is advertised.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing session port; 0 picks an ephemeral one.
    #[arg(short, long, default_value_t = 5000)]
    client_port: u16,

    /// Directory service address.
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    directory: SocketAddr,

    /// Path of the local snapshot file.
    #[arg(short, long, default_value = "rendezvous.db")]
    snapshot: PathBuf,

    /// Worker configuration in TOML format, e.g.
    /// 'heartbeat_interval_ms = 5000'.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(RendezvousError)` on any error.
    fn sanitize(&self) -> Result<(), RendezvousError> {
        if self.client_port != 0 && self.client_port <= 1024 {
            Err(RendezvousError::msg(format!(
                "invalid client_port {}",
                self.client_port
            )))
        } else if self.directory.port() == 0
            || self.directory.ip().is_unspecified()
        {
            Err(RendezvousError::msg(format!(
                "invalid directory address {}",
                self.directory
            )))
        } else if self.snapshot.file_name().is_none() {
            Err(RendezvousError::msg(format!(
                "invalid snapshot path '{}'",
                self.snapshot.display()
            )))
        } else if self.threads < 2 {
            Err(RendezvousError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of Rendezvous worker.
fn worker_main() -> Result<(), RendezvousError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config_str = if args.config.is_empty() {
        None
    } else {
        Some(args.config.clone())
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, setup the worker node, and start the main
        // event loop logic
        runtime.block_on(async move {
            let node = WorkerNode::new_and_setup(
                args.bind_ip.into(),
                args.client_port,
                args.directory,
                args.snapshot,
                Arc::new(LoggingSession),
                config_str.as_deref(),
            )
            .await?;
            let _ = ME.set(node.copy_addr().to_string());
            pf_info!("serving clients on '{}'", node.client_addr());

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), RendezvousError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Rendezvous worker.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = worker_main() {
        pf_error!("worker_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
