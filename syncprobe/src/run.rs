use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use syncprobe_core::{DriveClient, DropboxClient};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::{copy_to_clipboard, open_in_browser, prompt_yes_no, render_script, wait_for_enter};
use crate::callback_server::{self, BrowserFlags, CallbackState};
use crate::probe::aggregate::Aggregator;
use crate::probe::correlate::Correlator;
use crate::probe::iteration::{FILE_NAME_PREFIX, IterationStore, Stamp};
use crate::probe::local_poller::LocalPoller;
use crate::probe::pacing::Pacing;
use crate::probe::phase::{PhaseDriver, PhaseKind, PhaseReport, WaitPolicy};
use crate::probe::provider::{
    DriveProvider, DropboxProvider, LocalFolder, ProviderKind, StorageProvider,
};
use crate::tunnel::Tunnel;

const DEFAULT_ITERATIONS: u64 = 20;
const DEFAULT_PAUSE_RANGE_SECS: u64 = 15;
const DEFAULT_NGROK_BIN: &str = "ngrok";
const DEFAULT_NGROK_API: &str = "http://127.0.0.1:4040";
const DROPBOX_CONFIG_FILE: &str = "dropbox_config.json";
const PORT_RANGE: std::ops::Range<u16> = 10_000..20_000;
const FLAG_DOT_INTERVAL: Duration = Duration::from_secs(2);
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("callback server is not reachable through {url}: {detail}")]
    Reachability { url: String, detail: String },
    #[error("browser did not report {what} within {waited:?}")]
    BrowserTimeout { what: &'static str, waited: Duration },
    #[error("run aborted: {0}")]
    Aborted(&'static str),
}

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub provider: ProviderKind,
    pub iterations: usize,
    pub pause_range_secs: u64,
    pub port: u16,
    pub public_url: Option<String>,
    pub ngrok_bin: String,
    pub ngrok_api: String,
    pub local_root: PathBuf,
    pub sync_timeout: Option<Duration>,
    pub dropbox_token: Option<String>,
    pub drive_token: Option<String>,
}

impl ProbeConfig {
    pub fn from_env(provider: ProviderKind) -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let iterations = read_u64_env("SYNCPROBE_ITERATIONS", DEFAULT_ITERATIONS);
        if iterations == 0 {
            anyhow::bail!("SYNCPROBE_ITERATIONS must be at least 1");
        }
        let pause_range_secs = read_u64_env("SYNCPROBE_PAUSE_RANGE_SECS", DEFAULT_PAUSE_RANGE_SECS);
        let port = read_port_env("SYNCPROBE_PORT")
            .unwrap_or_else(|| random_port(&mut StdRng::from_entropy()));
        let local_root = std::env::var("SYNCPROBE_LOCAL_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| expand_with_home(provider.default_local_root(), &home));
        let sync_timeout = match read_u64_env("SYNCPROBE_SYNC_TIMEOUT_SECS", 0) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            provider,
            iterations: iterations as usize,
            pause_range_secs,
            port,
            public_url: read_string_env("SYNCPROBE_PUBLIC_URL"),
            ngrok_bin: read_string_env("SYNCPROBE_NGROK_BIN")
                .unwrap_or_else(|| DEFAULT_NGROK_BIN.to_string()),
            ngrok_api: read_string_env("SYNCPROBE_NGROK_API")
                .unwrap_or_else(|| DEFAULT_NGROK_API.to_string()),
            local_root,
            sync_timeout,
            dropbox_token: read_string_env("SYNCPROBE_DROPBOX_TOKEN"),
            drive_token: read_string_env("SYNCPROBE_DRIVE_TOKEN"),
        })
    }

    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            max_wait: self.sync_timeout,
            ..WaitPolicy::default()
        }
    }
}

pub struct ProbeRuntime {
    config: ProbeConfig,
    store: Arc<IterationStore>,
    flags: Arc<BrowserFlags>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl ProbeRuntime {
    pub fn new(config: ProbeConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            config,
            store: Arc::new(IterationStore::new()),
            flags: Arc::new(BrowserFlags::default()),
            cancel: CancellationToken::new(),
            http,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("failed to bind callback server on port {}", self.config.port))?;
        info!(
            port = self.config.port,
            provider = self.config.provider.label(),
            iterations = self.config.iterations,
            "callback server started"
        );
        let server = callback_server::spawn(
            listener,
            CallbackState::new(
                Arc::clone(&self.flags),
                Correlator::new(Arc::clone(&self.store), Stamp::WebSyncAt),
            ),
            self.cancel.clone(),
        );

        let session = async {
            let tunnel = self.open_tunnel().await?;
            let outcome = self.run_phases(&tunnel).await;
            tunnel.stop().await;
            outcome
        };
        let outcome = tokio::select! {
            outcome = session => outcome,
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    warn!("interrupted, tearing down tunnel and background tasks");
                    Err(RunError::Aborted("interrupted").into())
                }
                Err(err) => Err(anyhow::Error::new(err).context("failed to listen for interrupt")),
            },
        };

        self.cancel.cancel();
        let server_abort = server.abort_handle();
        match tokio::time::timeout(SERVER_SHUTDOWN_GRACE, server).await {
            Ok(Ok(Ok(()))) => info!("callback server stopped"),
            Ok(Ok(Err(err))) => warn!(error = %err, "callback server failed"),
            Ok(Err(err)) => warn!(error = %err, "callback server task failed"),
            Err(_) => {
                warn!("callback server did not stop in time, aborting");
                server_abort.abort();
            }
        }
        outcome
    }

    async fn open_tunnel(&self) -> anyhow::Result<Tunnel> {
        let tunnel = match &self.config.public_url {
            Some(url) => Tunnel::external(url).context("invalid SYNCPROBE_PUBLIC_URL")?,
            None => {
                println!("Opening a public tunnel to the callback server...");
                Tunnel::start_ngrok(&self.config.ngrok_bin, &self.config.ngrok_api, self.config.port)
                    .await
                    .context("failed to start tunnel")?
            }
        };
        println!(
            "Tunnel set up on {}, checking that the callback server responds...",
            tunnel.public_url()
        );
        verify_reachable(&self.http, &tunnel.endpoint("ping"), &self.flags).await?;
        println!("Callback server is reachable at {}", tunnel.public_url());
        Ok(tunnel)
    }

    async fn run_phases(&self, tunnel: &Tunnel) -> anyhow::Result<()> {
        let test_id = generate_test_id(&mut StdRng::from_entropy());
        let kind = self.config.provider;
        match kind {
            ProviderKind::Dropbox => {
                let token = resolve_dropbox_token(
                    self.config.dropbox_token.as_deref(),
                    Path::new(DROPBOX_CONFIG_FILE),
                )
                .await?;
                let client = DropboxClient::new(token).context("invalid dropbox client config")?;
                let remote = DropboxProvider::prepare(client, kind.perf_folder(), &test_id)
                    .await
                    .context("failed to prepare dropbox test folder")?;
                self.run_with(tunnel, &remote, &remote.web_folder_url(), &test_id)
                    .await
            }
            ProviderKind::GoogleDrive => {
                let token = self
                    .config
                    .drive_token
                    .clone()
                    .context("SYNCPROBE_DRIVE_TOKEN is not set")?;
                let client = DriveClient::new(token).context("invalid google drive client config")?;
                let remote = DriveProvider::prepare(client, kind.perf_folder(), &test_id)
                    .await
                    .context("failed to prepare google drive test folder")?;
                self.run_with(tunnel, &remote, &remote.web_folder_url(), &test_id)
                    .await
            }
        }
    }

    async fn run_with<P: StorageProvider>(
        &self,
        tunnel: &Tunnel,
        remote: &P,
        web_folder_url: &str,
        test_id: &str,
    ) -> anyhow::Result<()> {
        let kind = self.config.provider;
        let iterations = self.config.iterations;
        let test_folder = format!("{}/{test_id}", kind.perf_folder());
        let mut driver = PhaseDriver::new(
            Arc::clone(&self.store),
            Pacing::new(self.config.pause_range_secs),
            self.config.wait_policy(),
        );
        let mut aggregator = Aggregator::new();

        if prompt_yes_no(&format!(
            "Open your browser to the test folder '{test_folder}' now?"
        ))
        .await?
        {
            if let Err(err) = open_in_browser(web_folder_url).await {
                warn!(error = %err, url = web_folder_url, "could not open browser");
                println!("Open {web_folder_url} manually.");
            }
        }
        self.present_script(tunnel).await?;

        println!(
            "\nFirst test: uploading {iterations} files via the API and measuring how long they take to appear in the web view."
        );
        let report = driver
            .run_creates(PhaseKind::ApiToWeb, remote, 0, iterations)
            .await?;
        print_report(kind, &report, &mut aggregator);

        print!("\nDeleting the uploaded files to clear the web view for the next test");
        let entries = remote.list_entries().await?;
        for entry in &entries {
            remote.delete(entry).await?;
            print!(".");
            flush_stdout();
        }
        println!("\nAll {} files deleted.", entries.len());
        print!("Waiting for the browser script to report an empty folder (keep the tab focused, don't reload)");
        wait_for_flag(
            "an empty folder",
            || self.flags.is_empty(),
            FLAG_DOT_INTERVAL,
            self.config.sync_timeout,
        )
        .await?;

        let local_dir = self.config.local_root.join(kind.local_test_folder(test_id));
        let local = LocalFolder::create(&local_dir)
            .await
            .with_context(|| format!("failed to create local test folder {}", local_dir.display()))?;
        if !kind.syncs_remote_to_local() {
            self.reattach_to_local_folder(tunnel, kind, test_id).await?;
        }

        println!(
            "\n\nSecond test: writing {iterations} files to {} and measuring how long they take to appear in the web view.",
            local.path().display()
        );
        let first_local_id = iterations as u64;
        let report = driver
            .run_creates(PhaseKind::LocalDriveToWeb, &local, first_local_id, iterations)
            .await?;
        print_report(kind, &report, &mut aggregator);

        if kind.syncs_remote_to_local() {
            println!(
                "\n\nFinal test: deleting {iterations} files via the API and measuring how long the deletions take to reach the local drive."
            );
            let poller_cancel = self.cancel.child_token();
            let poller = LocalPoller::new(local.path(), FILE_NAME_PREFIX)
                .spawn(
                    Correlator::new(Arc::clone(&self.store), Stamp::LocalDeletedAt),
                    poller_cancel.clone(),
                )
                .await;
            let outcome = driver
                .run_deletes(
                    PhaseKind::ApiToLocalDrive,
                    remote,
                    first_local_id..first_local_id + iterations as u64,
                )
                .await;
            poller_cancel.cancel();
            match poller.await {
                Ok(state) => info!(state = ?state, "local poller finished"),
                Err(err) => warn!(error = %err, "local poller task failed"),
            }
            print_report(kind, &outcome?, &mut aggregator);
        }

        println!("\n--- {} ---\n", kind.label());
        for line in aggregator.summary_lines(iterations) {
            println!("{line}");
        }
        Ok(())
    }

    /// The web view only follows uploads from a separate local folder, so the
    /// operator re-opens a tab there and attaches the script again.
    async fn reattach_to_local_folder(
        &self,
        tunnel: &Tunnel,
        kind: ProviderKind,
        test_id: &str,
    ) -> anyhow::Result<()> {
        let local_folder = kind.local_test_folder(test_id);
        println!(
            "\n{} does not sync web changes down to this machine, so the next test writes into a new local folder that syncs upwards.",
            kind.label()
        );
        wait_for_enter("Close the current web tab, then press enter and a new tab will open.").await?;
        self.flags.rearm_ready();
        if let Err(err) = open_in_browser(kind.web_home_url()).await {
            warn!(error = %err, "could not open browser");
            println!("Open {} manually.", kind.web_home_url());
        }
        println!("Navigate to the '{}' folder in the web view.", local_folder.display());
        if !prompt_yes_no(&format!(
            "Have you got the '{}' folder open in your browser?",
            local_folder.display()
        ))
        .await?
        {
            return Err(RunError::Aborted("the local folder tab was not opened").into());
        }
        self.present_script(tunnel).await
    }

    async fn present_script(&self, tunnel: &Tunnel) -> anyhow::Result<()> {
        let script = render_script(self.config.provider, tunnel.public_url().as_str());
        println!(
            "\nRun this script in the browser console of the {} web view of the folder:\n\n{script}\n",
            self.config.provider.label()
        );
        match copy_to_clipboard(&script) {
            Some(tool) => println!("The script was copied to your clipboard ({tool})."),
            None => println!("Could not copy the script to the clipboard, copy it from above."),
        }
        print!("\nWaiting for the script to attach");
        wait_for_flag(
            "script attachment",
            || self.flags.is_ready(),
            FLAG_DOT_INTERVAL,
            self.config.sync_timeout,
        )
        .await?;
        Ok(())
    }
}

fn print_report(kind: ProviderKind, report: &PhaseReport, aggregator: &mut Aggregator) {
    println!(
        "\n\n{} {} test complete:\n",
        kind.label(),
        report.kind.as_str()
    );
    for line in report.csv_lines() {
        println!("{line}");
    }
    for timing in &report.timings {
        aggregator.record(report.kind, timing);
    }
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

include!("run_helpers.rs");

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
