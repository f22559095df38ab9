//! Rendezvous directory service.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use rendezvous::{logger_init, pf_error, DirectoryService, RendezvousError, ME};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// UDP port clients and workers send requests to.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Service configuration in TOML format, e.g.
    /// 'stale_threshold_ms = 15000'.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(RendezvousError)` on any error.
    fn sanitize(&self) -> Result<(), RendezvousError> {
        if self.port <= 1024 {
            Err(RendezvousError::msg(format!("invalid port {}", self.port)))
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

/// Actual main function of Rendezvous directory service.
fn directory_main() -> Result<(), RendezvousError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let bind_addr = SocketAddr::new(args.bind_ip.into(), args.port);
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
            .thread_name("tokio-worker-directory")
            .build()?;

        // enter tokio runtime, setup the directory service, and start the
        // main event loop logic
        runtime.block_on(async move {
            let directory =
                DirectoryService::new_and_setup(bind_addr, config_str.as_deref())
                    .await?;

            directory.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), RendezvousError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Rendezvous directory service.
fn main() -> ExitCode {
    logger_init();
    let _ = ME.set("ds".into());

    if let Err(ref e) = directory_main() {
        pf_error!("directory_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), RendezvousError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 9000,
            config: "".into(),
            threads: 2,
        };
        assert_eq!(args.sanitize(), Ok(()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_port() -> Result<(), RendezvousError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 1023,
            config: "".into(),
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), RendezvousError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            port: 9000,
            config: "".into(),
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
