use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubebridge::{
    command::{
        self,
        clean::CleanOptions,
        connect::ConnectOptions,
        exchange::ExchangeOptions,
        mesh::MeshOptions,
        Context, Expose,
    },
    config::Config,
    k8s::K8sClient,
    tunnel::ResolvConf,
};

/// Connect a local machine to a Kubernetes cluster through shadow pods
#[derive(Parser, Debug)]
#[command(name = "kubebridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Namespace for shadow resources
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route cluster pod and service networks to this machine
    Connect {
        /// Extra CIDRs to route (comma separated)
        #[arg(long, value_delimiter = ',')]
        include_ips: Vec<String>,

        /// CIDRs to leave out (comma separated)
        #[arg(long, value_delimiter = ',')]
        exclude_ips: Vec<String>,

        /// Namespace to sample pod IPs from when nodes hide their pod CIDR
        #[arg(long)]
        pod_cidr_namespace: Option<String>,

        /// Keep the shadow pod when the session ends
        #[arg(long)]
        skip_cleanup: bool,
    },
    /// Redirect all traffic of a deployment to this machine
    Exchange {
        deployment: String,

        #[command(flatten)]
        expose: ExposeArgs,
    },
    /// Redirect requests with a version mark from a service to this machine
    Mesh {
        service: String,

        #[command(flatten)]
        expose: ExposeArgs,

        /// Version mark routed here (random if not set)
        #[arg(long)]
        version_mark: Option<String>,
    },
    /// Remove resources left behind by ended sessions
    Clean {
        /// Only print what would be cleaned
        #[arg(long)]
        dry_run: bool,

        /// Heartbeat age in minutes after which a resource is cleaned
        #[arg(long)]
        threshold: Option<i64>,
    },
}

#[derive(Args, Debug)]
struct ExposeArgs {
    /// Ports to expose, `<port>` or `<local>:<remote>` (comma separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    expose: Vec<Expose>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(kubeconfig) = cli.kubeconfig {
        config.kubeconfig = Some(kubeconfig);
    }

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
    tracing::debug!(?config, "Configuration loaded");

    let cluster = K8sClient::connect(&config).await?;
    cluster.health_check().await?;
    let token = CancellationToken::new();
    let ctx = Context {
        config,
        cluster: Arc::new(cluster),
        name_server: Arc::new(ResolvConf::default()),
        token: token.clone(),
        debug: cli.debug,
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            token.cancel();
        }
    });

    match cli.command {
        Commands::Connect {
            include_ips,
            exclude_ips,
            pod_cidr_namespace,
            skip_cleanup,
        } => {
            let opts = ConnectOptions {
                include_ips,
                exclude_ips,
                pod_cidr_namespace,
                skip_cleanup,
            };
            command::connect::run(&ctx, &opts).await?;
        }
        Commands::Exchange { deployment, expose } => {
            let opts = ExchangeOptions {
                deployment,
                expose: expose.expose,
            };
            command::exchange::run(&ctx, &opts).await?;
        }
        Commands::Mesh {
            service,
            expose,
            version_mark,
        } => {
            let opts = MeshOptions {
                service,
                expose: expose.expose,
                version_mark,
            };
            command::mesh::run(&ctx, &opts).await?;
        }
        Commands::Clean { dry_run, threshold } => {
            let opts = CleanOptions {
                dry_run,
                threshold_minutes: threshold,
            };
            let outcome = command::clean::run(&ctx, &opts).await?;
            if let Some(report) = outcome.report {
                tracing::info!(
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "Clean finished"
                );
            }
        }
    }

    Ok(())
}
