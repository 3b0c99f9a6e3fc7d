use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;

/// Secrets the relay needs before it can serve: where the durable store
/// lives and the key used to sign handshake tokens.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub database_url: Option<String>,
    pub broadcast_secret: String,
}

/// One source's (possibly partial) answer.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PartialCredentials {
    pub database_url: Option<String>,
    pub broadcast_secret: Option<String>,
}

/// Resolve credentials through the ordered chain: explicit configuration,
/// bootstrap fetch from the companion service, then the process environment.
/// Errors only when no source yields a signing secret; a missing store
/// location is reported to the caller, which may serve degraded.
pub async fn resolve(config: &Config) -> Result<Credentials> {
    let mut sources = vec![from_config(config)];
    if let Some(url) = &config.bootstrap_url {
        match fetch_bootstrap(url).await {
            Ok(partial) => sources.push(partial),
            Err(err) => warn!(error = %err, "credential bootstrap fetch failed, falling through"),
        }
    }
    sources.push(from_env());

    let creds = merge(sources)
        .context("no credential source yielded a broadcast signing secret")?;
    if creds.database_url.is_none() {
        warn!("store credentials unresolved, relay will run without a durable store");
    }
    Ok(creds)
}

fn from_config(config: &Config) -> PartialCredentials {
    PartialCredentials {
        database_url: config.database_url.clone(),
        broadcast_secret: config.broadcast_secret.clone(),
    }
}

fn from_env() -> PartialCredentials {
    PartialCredentials {
        database_url: std::env::var("DATABASE_URL").ok(),
        broadcast_secret: std::env::var("API_SECRET").ok(),
    }
}

async fn fetch_bootstrap(base_url: &str) -> Result<PartialCredentials> {
    let url = format!("{}/internal/relay-credentials", base_url.trim_end_matches('/'));
    let client = reqwest::ClientBuilder::new()
        .timeout(Duration::from_secs(5))
        .build()?;
    let partial = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<PartialCredentials>()
        .await?;
    info!(%url, "fetched bootstrap credentials");
    Ok(partial)
}

/// First source wins per field. Returns `None` when no source supplied a
/// signing secret.
fn merge(sources: impl IntoIterator<Item = PartialCredentials>) -> Option<Credentials> {
    let mut database_url = None;
    let mut broadcast_secret = None;
    for source in sources {
        if database_url.is_none() {
            database_url = source.database_url;
        }
        if broadcast_secret.is_none() {
            broadcast_secret = source.broadcast_secret;
        }
    }
    Some(Credentials {
        database_url,
        broadcast_secret: broadcast_secret?,
    })
}
