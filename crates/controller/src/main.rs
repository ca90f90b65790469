mod api;
mod auth;
mod cli;
mod db;
mod router;
mod scheduler;
mod state;
mod store;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state::AppState;
use crate::store::Store;

async fn serve(args: cli::Cli) -> anyhow::Result<()> {
    let pool = db::init_pg_pool(&args.resolved_database_url()).await?;
    let store = Store::new(pool);

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler::run(store.clone(), cancel.child_token()));

    let state = Arc::new(AppState {
        store,
        access_token: args.access_token.clone(),
    });
    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.address).await?;
    info!(
        "controller listening on http://{} (auth: {})",
        args.address,
        if args.access_token.is_some() { "bearer" } else { "disabled" }
    );

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    scheduler_task.await.ok();
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

    if args.address.trim().is_empty() {
        error!("--address must not be empty");
        return ExitCode::from(1);
    }

    match serve(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}
