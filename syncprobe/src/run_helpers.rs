fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_port_env(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .filter(|port| *port > 0)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn random_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    rng.gen_range(PORT_RANGE)
}

/// Six lowercase hex chars naming this run's test folder.
fn generate_test_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{:06x}", rng.gen_range(0..0x100_0000u32))
}

async fn resolve_dropbox_token(explicit: Option<&str>, config_path: &Path) -> anyhow::Result<String> {
    if let Some(token) = explicit {
        return Ok(token.to_string());
    }
    let raw = tokio::fs::read_to_string(config_path).await.with_context(|| {
        format!(
            "SYNCPROBE_DROPBOX_TOKEN is not set and {} could not be read",
            config_path.display()
        )
    })?;
    let config: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", config_path.display()))?;
    config
        .get("access_token")
        .and_then(|token| token.as_str())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .with_context(|| format!("access_token attribute is missing in {}", config_path.display()))
}

/// Fetches `ping_url` and checks the callback server saw the request itself,
/// not just that something answered.
async fn verify_reachable(
    http: &reqwest::Client,
    ping_url: &str,
    flags: &BrowserFlags,
) -> Result<(), RunError> {
    let unreachable = |detail: String| RunError::Reachability {
        url: ping_url.to_string(),
        detail,
    };
    let response = http
        .get(ping_url)
        .send()
        .await
        .map_err(|err| unreachable(err.to_string()))?;
    if !flags.is_pinged() {
        return Err(unreachable(format!(
            "ping was not observed by the callback server (response status {})",
            response.status()
        )));
    }
    Ok(())
}

/// Prints a dot every `interval` until `check` holds.
async fn wait_for_flag(
    what: &'static str,
    check: impl Fn() -> bool,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<(), RunError> {
    let started = tokio::time::Instant::now();
    while !check() {
        if let Some(timeout) = timeout {
            if started.elapsed() >= timeout {
                println!();
                return Err(RunError::BrowserTimeout {
                    what,
                    waited: started.elapsed(),
                });
            }
        }
        print!(".");
        flush_stdout();
        tokio::time::sleep(interval).await;
    }
    println!();
    Ok(())
}
