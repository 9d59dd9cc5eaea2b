use std::future::Future;

use anyhow::Context;
use syncprobe::probe::provider::ProviderKind;
use syncprobe::run::{ProbeConfig, ProbeRuntime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run(ProviderKind),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut provider = None;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliMode::Help),
            other => match (ProviderKind::parse(other), provider) {
                (Some(kind), None) => provider = Some(kind),
                (Some(_), Some(_)) => anyhow::bail!("only one provider can be probed per run"),
                (None, _) => anyhow::bail!("unknown argument: {other}"),
            },
        }
    }
    match provider {
        Some(kind) => Ok(CliMode::Run(kind)),
        None => anyhow::bail!("missing provider, expected `dropbox` or `gdrive`"),
    }
}

fn print_usage() {
    println!("Usage: syncprobe <dropbox|gdrive>");
    println!("  dropbox   Measure Dropbox API, web and local drive sync latency");
    println!("  gdrive    Measure Google Drive API, web and local drive sync latency");
    println!("  --help    Show this message");
}

/// Drives `future` on a fresh runtime and drops it without joining blocking
/// tasks, so a stdin prompt pending at Ctrl-C cannot keep the process alive.
fn run_detached<F>(future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let outcome = runtime.block_on(future);
    runtime.shutdown_background();
    outcome
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let provider = match parse_cli_mode(std::env::args()) {
        Ok(CliMode::Run(provider)) => provider,
        Ok(CliMode::Help) => {
            print_usage();
            return Ok(());
        }
        Err(err) => {
            print_usage();
            return Err(err);
        }
    };
    let config = ProbeConfig::from_env(provider)?;
    run_detached(async move { ProbeRuntime::new(config)?.run().await })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("syncprobe")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_selects_provider() {
        assert_eq!(
            parse_cli_mode(args(&["dropbox"])).unwrap(),
            CliMode::Run(ProviderKind::Dropbox)
        );
        assert_eq!(
            parse_cli_mode(args(&["gdrive"])).unwrap(),
            CliMode::Run(ProviderKind::GoogleDrive)
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["dropbox", "-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_missing_or_unknown_provider() {
        assert!(parse_cli_mode(args(&[])).is_err());
        assert!(parse_cli_mode(args(&["onedrive"])).is_err());
        assert!(parse_cli_mode(args(&["dropbox", "gdrive"])).is_err());
    }

    #[test]
    fn detached_run_does_not_wait_for_pending_blocking_reads() {
        let started = std::time::Instant::now();
        let outcome = run_detached(async {
            tokio::task::spawn_blocking(|| {
                std::thread::sleep(std::time::Duration::from_secs(30))
            });
            Err(anyhow::anyhow!("interrupted"))
        });

        assert_eq!(outcome.unwrap_err().to_string(), "interrupted");
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn detached_run_returns_the_future_outcome() {
        assert!(run_detached(async { Ok(()) }).is_ok());
    }
}
