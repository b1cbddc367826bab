//! Seldon Operator - serves machine-learning inference graphs on Kubernetes

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use seldon_common::config::OperatorConfig;
use seldon_common::crd::SeldonDeployment;
use seldon_common::kube_utils::create_client;
use seldon_common::telemetry::{init_telemetry, TelemetryConfig};
use seldon_common::{DEFAULT_WEBHOOK_PORT, FIELD_MANAGER};
use seldon_operator::controller_runner::build_deployment_controller;
use seldon_operator::webhook::{self, WebhookState};

/// Default location of the webhook serving certificate
const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Seldon - Kubernetes operator for machine-learning inference graphs
#[derive(Parser, Debug)]
#[command(name = "seldon-operator", version, about, long_about = None)]
struct Cli {
    /// Print the SeldonDeployment CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig file (in-cluster configuration when unset)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SeldonDeployment controller (default mode)
    Controller {
        /// Install or update the SeldonDeployment CRD on startup
        #[arg(long, env = "SELDON_INSTALL_CRD")]
        install_crd: bool,
    },

    /// Serve the mutating and validating admission webhooks
    Webhook {
        /// HTTPS listen port
        #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
        port: u16,

        /// Directory holding tls.crt and tls.key
        #[arg(long, env = "WEBHOOK_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
        cert_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The webhook server and API client cannot use TLS without it.",
            e
        );
        std::process::exit(1);
    }

    #[cfg(feature = "fips")]
    {
        if let Err(e) = aws_lc_rs::try_fips_mode() {
            eprintln!(
                "CRITICAL: FIPS feature is enabled but FIPS mode failed to initialize: {}",
                e
            );
            std::process::exit(1);
        }
        eprintln!("FIPS mode: ENABLED (aws-lc-rs FIPS 140-3 validated module)");
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SeldonDeployment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let _telemetry = init_telemetry(TelemetryConfig::from_env("seldon-operator"))?;

    let config = Arc::new(OperatorConfig::from_env()?);
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    match cli.command {
        Some(Commands::Webhook { port, cert_dir }) => {
            run_webhook(client, config, port, cert_dir).await
        }
        Some(Commands::Controller { install_crd }) => {
            run_controller(client, config, install_crd).await
        }
        None => run_controller(client, config, false).await,
    }
}

async fn run_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    install_crd: bool,
) -> anyhow::Result<()> {
    if install_crd {
        ensure_crd_installed(&client).await?;
    }

    tracing::info!(
        controller_id = ?config.controller_id,
        controller_namespace = %config.controller_namespace,
        "Starting Seldon controller"
    );
    build_deployment_controller(client, config).await;

    tracing::info!("Seldon controller shutting down");
    Ok(())
}

async fn run_webhook(
    client: Client,
    config: Arc<OperatorConfig>,
    port: u16,
    cert_dir: PathBuf,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let state = Arc::new(WebhookState {
        kube: client,
        config,
    });
    webhook::serve(addr, &cert_dir, state).await?;
    Ok(())
}

/// Install or update the SeldonDeployment CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing SeldonDeployment CRD...");
    crds.patch(
        "seldondeployments.machinelearning.seldon.io",
        &params,
        &Patch::Apply(&SeldonDeployment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install SeldonDeployment CRD: {}", e))?;
    Ok(())
}
