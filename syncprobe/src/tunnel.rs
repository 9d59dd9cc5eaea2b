use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use url::Url;

const AGENT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const AGENT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to spawn tunnel binary {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel agent request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid tunnel url: {0}")]
    Url(#[from] url::ParseError),
    #[error("tunnel agent did not report an https tunnel within {0:?}")]
    NoPublicUrl(Duration),
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelInfo>,
}

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    public_url: String,
    #[serde(default)]
    proto: String,
}

/// Public https endpoint forwarding to the local callback server.
pub struct Tunnel {
    public_url: Url,
    child: Option<Child>,
}

impl Tunnel {
    /// Uses a tunnel the operator already runs.
    pub fn external(public_url: &str) -> Result<Self, TunnelError> {
        Ok(Self {
            public_url: Url::parse(public_url.trim_end_matches('/'))?,
            child: None,
        })
    }

    /// Spawns `ngrok http <port>` and waits until its agent API reports the
    /// https tunnel.
    pub async fn start_ngrok(bin: &str, agent_api: &str, port: u16) -> Result<Self, TunnelError> {
        let mut child = Command::new(bin)
            .args(["http", &port.to_string(), "--log", "stdout"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                bin: bin.to_string(),
                source,
            })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        let deadline = tokio::time::Instant::now() + AGENT_STARTUP_TIMEOUT;
        loop {
            match fetch_public_url(&http, agent_api).await {
                Ok(Some(public_url)) => {
                    info!(url = %public_url, "tunnel established");
                    return Ok(Self {
                        public_url,
                        child: Some(child),
                    });
                }
                Ok(None) => debug!("tunnel agent has no https tunnel yet"),
                Err(err) => debug!(error = %err, "tunnel agent not reachable yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(TunnelError::NoPublicUrl(AGENT_STARTUP_TIMEOUT));
            }
            tokio::time::sleep(AGENT_POLL_INTERVAL).await;
        }
    }

    pub fn public_url(&self) -> &Url {
        &self.public_url
    }

    /// Absolute URL of `path` behind the tunnel.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.public_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn stop(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to stop tunnel process");
            } else {
                info!("tunnel stopped");
            }
        }
    }
}

/// Reads the first https tunnel from the agent's `/api/tunnels` listing.
pub async fn fetch_public_url(
    http: &reqwest::Client,
    agent_api: &str,
) -> Result<Option<Url>, TunnelError> {
    let endpoint = format!("{}/api/tunnels", agent_api.trim_end_matches('/'));
    let list = http
        .get(endpoint)
        .send()
        .await?
        .error_for_status()?
        .json::<TunnelList>()
        .await?;
    let https = list
        .tunnels
        .into_iter()
        .find(|tunnel| tunnel.proto == "https" || tunnel.public_url.starts_with("https://"));
    match https {
        Some(tunnel) => Ok(Some(Url::parse(&tunnel.public_url)?)),
        None => Ok(None),
    }
}
