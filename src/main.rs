use anyhow::Context;
use clap::Parser;
use rocket::{catchers, routes, Build, Rocket};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
use config::{Opts, RelayConfig};

mod forwarder;
use forwarder::Forwarder;

mod github;
use github::GitHubClient;

mod relay;

mod status;
use status::{default_catcher, health, index, unauthorized};

mod webhooks;
use webhooks::github_webhook;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opts = Opts::parse();
    let config = RelayConfig::load(opts).context("couldn't load configuration")?;

    for warning in config.check_startup()? {
        warn!("{}", warning);
    }

    info!("starting relay with {:?}", config);
    let rocket = build_rocket(config)?;
    rocket
        .launch()
        .await
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!("rocket failed: {}", err))
}

/// Assembles the server: routes, catchers and the state shared by every request.
pub(crate) fn build_rocket(config: RelayConfig) -> anyhow::Result<Rocket<Build>> {
    let github = GitHubClient::new(&config).context("failed to create GitHub client")?;
    let forwarder = Forwarder::new(&config).context("failed to create forwarder")?;

    Ok(rocket::custom(config.figment())
        .mount("/", routes![index, health, github_webhook])
        .register("/", catchers![unauthorized, default_catcher])
        .manage(github)
        .manage(forwarder)
        .manage(config))
}
