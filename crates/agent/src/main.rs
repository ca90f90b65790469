mod cli;
mod endpoints;
mod gpu;
mod metrics;
mod reconciler;
mod registry;
mod state;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fleet_core::config::{hostname, parse_key_values};
use fleet_core::ControllerClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::registry::{SessionRegistry, UPDATE_CHANNEL_DEPTH};
use crate::state::AgentRuntime;

async fn run(
    args: cli::Cli,
    labels: std::collections::BTreeMap<String, String>,
    taints: std::collections::BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let gpus = match &args.renderer_path {
        _ if args.synthetic_gpus > 0 => {
            info!("advertising {} synthetic GPUs", args.synthetic_gpus);
            gpu::synthetic_gpus(args.synthetic_gpus)
        }
        Some(path) => gpu::detect_gpus(path).await?,
        None => unreachable!("validated at startup"),
    };

    let (session_tx, mut session_rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
    let (connection_tx, mut connection_rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
    let registry = SessionRegistry::new(session_tx, connection_tx);

    let controller_connected = args.controller.is_some();
    let advertised = args.expose.clone().unwrap_or_else(|| args.address.clone());
    let runtime = Arc::new(AgentRuntime::new(
        hostname(),
        advertised,
        args.pool,
        labels,
        taints,
        gpus,
        registry,
        controller_connected,
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(gpu::run_sampler(runtime.clone(), cancel.child_token()));

    let mut reconciler_task = None;
    match &args.controller {
        Some(controller) => {
            let client = ControllerClient::new(controller.clone(), args.access_token.clone());
            let agent_id =
                reconciler::connect_to_controller(&client, &runtime, args.agent_id).await?;

            let loop_cancel = cancel.clone();
            let worker = reconciler::Reconciler {
                client,
                agent_id,
                runtime: runtime.clone(),
                session_rx,
                connection_rx,
            };
            reconciler_task = Some(tokio::spawn(async move {
                let result = worker.run(loop_cancel.child_token()).await;
                // A dead reconciler leaves the agent unreachable for the
                // controller; take the whole process down.
                loop_cancel.cancel();
                result
            }));
        }
        None => {
            // Standalone: nobody consumes update events, so discard them.
            let drain_cancel = cancel.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = drain_cancel.cancelled() => return,
                        event = session_rx.recv() => if event.is_none() { return },
                        event = connection_rx.recv() => if event.is_none() { return },
                    }
                }
            });
        }
    }

    let app = endpoints::build_router(runtime);
    let listener = tokio::net::TcpListener::bind(&args.address).await?;
    info!(
        "agent listening on http://{} ({})",
        args.address,
        if controller_connected { "controller-connected" } else { "standalone" }
    );

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = shutdown_cancel.cancelled() => {}
            }
            shutdown_cancel.cancel();
        })
        .await?;

    cancel.cancel();
    if let Some(task) = reconciler_task {
        task.await??;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    fleet_core::config::load_dotenv();
    // Flag mistakes are configuration errors (exit 1), not clap's default 2.
    let args = match cli::Cli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = u8::from(e.use_stderr());
            e.print().ok();
            return ExitCode::from(code);
        }
    };

    if let Err(e) = args.validate() {
        error!("configuration error: {e}");
        return ExitCode::from(1);
    }
    let (labels, taints) = match (parse_key_values(&args.labels), parse_key_values(&args.taints)) {
        (Ok(labels), Ok(taints)) => (labels, taints),
        (Err(e), _) | (_, Err(e)) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match run(args, labels, taints).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}
