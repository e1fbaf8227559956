use clap::{Parser, Subcommand};
use svclocal_common::ipc::DEFAULT_IPC_PORT;

mod daemon;
mod ipc_server;
mod list;

#[derive(Parser)]
#[command(name = "svclocal")]
#[command(about = "Expose Kubernetes services as local network endpoints", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: forward discovered services to local addresses
    Run {
        /// Namespaces whose services are exposed (repeatable)
        #[arg(short, long = "namespace", default_values_t = vec!["default".to_string()])]
        namespaces: Vec<String>,

        /// Loopback CIDR that service IPs are allocated from
        #[arg(long, default_value = "127.0.0.0/8")]
        cidr: String,

        /// Kubeconfig context (defaults to the current context)
        #[arg(short, long)]
        context: Option<String>,

        /// Localhost TCP port for the IPC listener
        #[arg(long, default_value_t = DEFAULT_IPC_PORT)]
        ipc_port: u16,
    },

    /// List managed port-forwards and their statuses
    List {
        /// Localhost TCP port the daemon's IPC listener is on
        #[arg(long, default_value_t = DEFAULT_IPC_PORT)]
        ipc_port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Quiet the HTTP stack; its chatter drowns the forward lifecycle logs.
    let filter = EnvFilter::from_default_env()
        .add_directive(log_level.into())
        .add_directive("kube=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).without_time())
        .init();

    match cli.command {
        Commands::Run {
            namespaces,
            cidr,
            context,
            ipc_port,
        } => {
            daemon::run(daemon::DaemonOptions {
                namespaces,
                cidr,
                context,
                ipc_port,
            })
            .await
        }
        Commands::List { ipc_port } => list::execute(ipc_port).await,
    }
}
