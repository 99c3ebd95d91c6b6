mod config;
mod remote;
mod torrserver;
mod validation;
mod waiter;
mod web;

use anyhow::Context;
use config::Config;
use remote::Executor;
use std::sync::Arc;
use torrserver::TorrServer;
use waiter::MetadataWaiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub torrserver: Arc<TorrServer>,
    pub waiter: MetadataWaiter<TorrServer>,
}

impl AppState {
    fn new(config: Config) -> anyhow::Result<Self> {
        let exec = Executor::new(config.executor())?;
        let torrserver = Arc::new(TorrServer::new(exec));
        // The only campaign registry in the process; handlers share it through clones.
        let waiter = MetadataWaiter::new(
            torrserver.clone(),
            config.poll_settings(),
            config.settle_delay(),
        );

        Ok(Self {
            config: Arc::new(config),
            torrserver,
            waiter,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::load().context("load config")?;
    config.banner();

    let addr = config.bind_addr();
    let state = AppState::new(config).context("build TorrServer client")?;

    web::serve(state, addr).await
}
