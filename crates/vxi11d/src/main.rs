//! vxi11d entry point.
//!
//! Parses the command line, sets up logging and runs the simulated network
//! instrument until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netinstr_vxi11d::{NetinstrError, ServerConfig, Vxi11Server};

/// VXI-11 network instrument server simulator
#[derive(Parser, Debug)]
#[command(name = "vxi11d")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run the TCP portmapper (default)
    #[arg(long, overrides_with = "no_tcp")]
    tcp: bool,

    /// Do not run the TCP portmapper
    #[arg(long, overrides_with = "tcp")]
    no_tcp: bool,

    /// Run the UDP portmapper (default)
    #[arg(long, overrides_with = "no_udp")]
    udp: bool,

    /// Do not run the UDP portmapper
    #[arg(long, overrides_with = "udp")]
    no_udp: bool,

    /// Number of GPIB instruments behind the server (0-10). With 0 the server is
    /// the instrument itself ('TCPIP::<ip>::inst0::INSTR'); otherwise
    /// 'TCPIP::<ip>::gpib0,[1..N]::INSTR' is served as well
    #[arg(short = 'n', long = "instruments", allow_negative_numbers = true)]
    instruments: Option<i64>,

    /// Verbosity; -v logs VXI-11 requests, -vv also portmapper traffic
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbosity: u8,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to bind all listeners to
    #[arg(long)]
    host: Option<std::net::IpAddr>,

    /// Portmapper port
    #[arg(long)]
    rpcbind_port: Option<u16>,

    /// First port of the VXI-11 rotation range
    #[arg(long)]
    port_start: Option<u16>,

    /// Last port of the VXI-11 rotation range
    #[arg(long)]
    port_end: Option<u16>,
}

impl Args {
    /// Merge the command line over the configuration file.
    fn into_config(self) -> Result<ServerConfig, NetinstrError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load_or_default(path)?,
            None => ServerConfig::default(),
        };

        if self.tcp || self.no_tcp {
            config.tcp_portmapper = self.tcp;
        }
        if self.udp || self.no_udp {
            config.udp_portmapper = self.udp;
        }
        if let Some(n) = self.instruments {
            if n < 0 {
                return Err(NetinstrError::config(
                    "the number of instruments must be 0 or greater",
                ));
            }
            config.num_instruments = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if self.verbosity > 0 {
            config.log_vxi11 = true;
        }
        if self.verbosity > 1 {
            config.log_mapping = true;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.rpcbind_port {
            config.rpcbind_port = port;
        }
        if let Some(port) = self.port_start {
            config.vxi11_port_start = port;
        }
        if let Some(port) = self.port_end {
            config.vxi11_port_end = port;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Initialize tracing. `RUST_LOG` wins over the verbosity flags.
fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = String::from("info");
        if config.log_vxi11 {
            directives.push_str(",vxi11=debug");
        }
        if config.log_mapping {
            directives.push_str(",portmap=debug");
        }
        EnvFilter::new(directives)
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vxi11d: {}", e);
            return ExitCode::from(1);
        }
    };

    init_logging(&config);

    info!("Starting network server...");
    info!(instruments = config.num_instruments, "Initializing...");

    let server = match Vxi11Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Fatal error: {}", e);
            return ExitCode::from(1);
        }
    };

    info!("Running server...");
    match server.run().await {
        Ok(()) => {
            info!("Bye.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal error: {}", e);
            ExitCode::from(1)
        }
    }
}
