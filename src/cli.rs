use bisectbot::config::Config;
use bisectbot::prelude::*;
use bisectbot::{db, forge, http, metrics, scheduler, sandbox};
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// Fail-fast-at-startup CLI, narrowed to the two commands this service
/// needs: run the service, or just validate the environment without
/// starting it.
#[derive(Parser)]
#[command(name = "bisectbot", about = "distributed git-bisect bot")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts the HTTP server and the job scheduler.
    Serve,
    /// Validates the environment and exits without starting anything.
    CheckConfig,
}

impl Cli {
    pub fn run(self) -> Fallible<()> {
        match self.command {
            Command::CheckConfig => {
                Config::load()?;
                info!("configuration looks valid");
                Ok(())
            }
            Command::Serve => serve(),
        }
    }
}

fn serve() -> Fallible<()> {
    let config = Config::load()?;
    let runtime = tokio::runtime::Runtime::new().context("building the tokio runtime")?;
    runtime.block_on(serve_async(config))
}

async fn serve_async(config: Config) -> Fallible<()> {
    let db = db::Database::open_at(&config.database_url)?;
    let forge = Arc::new(forge::ForgeClient::new(&config)?);
    let sandbox: Arc<dyn sandbox::Sandbox> =
        Arc::new(sandbox::DockerSandbox::new(config.sandbox_image.clone()));
    let metrics = metrics::Metrics::new()?;

    let state = http::AppState {
        db: db.clone(),
        forge: Arc::clone(&forge),
        sandbox: Arc::clone(&sandbox),
        config: config.clone(),
        metrics: metrics.clone(),
    };

    let scheduler = Arc::new(scheduler::Scheduler::new(
        db,
        forge,
        sandbox,
        config.clone(),
        metrics,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let routes = http::routes(state).recover(http::recover);
    let (_, server) =
        warp::serve(routes).bind_with_graceful_shutdown(config.bind_addr, async move {
            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
        });

    server.await;
    scheduler_task.await.context("scheduler task panicked")?;
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    info!("shutdown signal received, draining in-flight jobs");
}
