use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::{Client, CustomResourceExt};

use controller::{
    api::{AIGatewayRoute, AIServiceBackend, BackendSecurityPolicy},
    reconcilers::{self, ReconcilerCtx},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    /// Image the managed external-processor deployments run
    #[arg(
        long,
        env = "AI_GATEWAY_EXTPROC_IMAGE",
        default_value = "ghcr.io/envoyproxy/ai-gateway/extproc:latest"
    )]
    extproc_image: String,
    /// Log level passed to the managed processors
    #[arg(long, env = "AI_GATEWAY_EXTPROC_LOG_LEVEL", default_value = "info")]
    extproc_log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the controller reconciliation loops
    #[command(subcommand)]
    Reconcile(ReconcileTarget),
    /// Output K8s manifest for a given CRD resource
    #[command(subcommand)]
    CrdManifest(Crd),
}

#[derive(Debug, Clone, Subcommand)]
enum ReconcileTarget {
    Routes,
    Backends,
    SecurityPolicies,
    Secrets,
    All,
}

#[derive(Debug, Clone, Subcommand)]
enum Crd {
    Route,
    Backend,
    SecurityPolicy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Reconcile(target)) => {
            run_controller(target, cli.extproc_image, cli.extproc_log_level).await?
        }
        Some(Commands::CrdManifest(crd)) => {
            let crd = match crd {
                Crd::Route => AIGatewayRoute::crd(),
                Crd::Backend => AIServiceBackend::crd(),
                Crd::SecurityPolicy => BackendSecurityPolicy::crd(),
            };

            println!("{}", serde_yaml_ng::to_string(&crd)?);
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(
    target: ReconcileTarget,
    extproc_image: String,
    extproc_log_level: String,
) -> anyhow::Result<()> {
    let client = Client::try_default().await.expect("connect to k8s");
    let context = Arc::new(ReconcilerCtx::new(
        client.clone(),
        extproc_image,
        extproc_log_level,
    )?);

    match target {
        ReconcileTarget::Routes => {
            reconcilers::route::control_loop(client, context)
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled route {:?}", o),
                        Err(e) => tracing::error!("Route reconcile failed: {:?}", e),
                    }
                })
                .await
        }
        ReconcileTarget::Backends => {
            reconcilers::backend::control_loop(client, context)
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled backend {:?}", o),
                        Err(e) => tracing::error!("Backend reconcile failed: {:?}", e),
                    }
                })
                .await
        }
        ReconcileTarget::SecurityPolicies => {
            reconcilers::security_policy::control_loop(client, context)
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled security policy {:?}", o),
                        Err(e) => tracing::error!("Security policy reconcile failed: {:?}", e),
                    }
                })
                .await
        }
        ReconcileTarget::Secrets => {
            reconcilers::secret::control_loop(client, context)
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled secret {:?}", o),
                        Err(e) => tracing::error!("Secret reconcile failed: {:?}", e),
                    }
                })
                .await
        }
        ReconcileTarget::All => {
            let routes = reconcilers::route::control_loop(client.clone(), context.clone())
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled route {:?}", o),
                        Err(e) => tracing::error!("Route reconcile failed: {:?}", e),
                    }
                });
            let backends = reconcilers::backend::control_loop(client.clone(), context.clone())
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled backend {:?}", o),
                        Err(e) => tracing::error!("Backend reconcile failed: {:?}", e),
                    }
                });
            let policies =
                reconcilers::security_policy::control_loop(client.clone(), context.clone())
                    .for_each(|res| async move {
                        match res {
                            Ok(o) => tracing::info!("Reconciled security policy {:?}", o),
                            Err(e) => {
                                tracing::error!("Security policy reconcile failed: {:?}", e)
                            }
                        }
                    });
            let secrets = reconcilers::secret::control_loop(client, context)
                .for_each(|res| async move {
                    match res {
                        Ok(o) => tracing::info!("Reconciled secret {:?}", o),
                        Err(e) => tracing::error!("Secret reconcile failed: {:?}", e),
                    }
                });

            futures::join!(routes, backends, policies, secrets);
        }
    };

    tracing::info!("controller terminated");
    Ok(())
}
