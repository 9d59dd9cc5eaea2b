use std::io::Write;
use std::process::{Command, Stdio};

use ashpd::desktop::open_uri::OpenFileRequest;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::probe::provider::ProviderKind;

const CALLBACK_PLACEHOLDER: &str = "__CALLBACK_BASE__";

const DROPBOX_SCRIPT: &str = r#"(function() {
  let folder = document.querySelector('div.brws-files-view');
  let filesSelector = 'table.mc-table.brws-files-view-list tr.brws-file-row';
  let filesByName = [];

  let getFn = (path) => {
    let request = new XMLHttpRequest();
    request.open('GET', `__CALLBACK_BASE__/${path}`);
    request.send();
  };

  if (!folder) { throw('Could not find the file list element. Did you run this script before the page rendered?'); }

  /* only new files are reported */
  folder.querySelectorAll(filesSelector).forEach((element) => { filesByName.push(element.getAttribute('data-filename')); });

  let timer = setInterval(() => {
    let files = folder.querySelectorAll(filesSelector);
    files.forEach((element) => {
      let fileName = element.getAttribute('data-filename');
      if (fileName && !filesByName.includes(fileName)) {
        getFn(`sync?fileName=${encodeURIComponent(fileName)}&ts=${new Date().getTime()}`);
        filesByName.push(fileName);
        console.log(`Detected new file: '${fileName}' at ${new Date()}`);
      }
    });
    if ((files.length === 0) && (filesByName.length !== 0)) {
      filesByName = [];
      getFn('empty');
    }
  }, 100);

  function stopPerfTimer() {
    if (timer) { clearInterval(timer); }
    console.log('Stopped performance timer.');
  };
  if (document.stopPerfTimer) { document.stopPerfTimer(); }
  document.stopPerfTimer = stopPerfTimer;

  getFn('ready');
  console.log('Now monitoring files and their create timestamps. Run `document.stopPerfTimer()` when done');
})();"#;

const DRIVE_SCRIPT: &str = r#"(function() {
  let visibleRootFolder = () => { return Array.from(document.querySelectorAll('div[role=main]')).find((elem) => { return elem.style.display !== 'none'; }); };
  let folder = () => { return visibleRootFolder().querySelector('div[role="presentation"] div[role="listbox"]'); };
  let filesSelector = 'div[data-target=doc] > div > div > div > div > div[aria-label] span[data-is-doc-name=true]';
  let filesByName = [];

  let getFn = (path) => {
    let request = new XMLHttpRequest();
    request.open('GET', `__CALLBACK_BASE__/${path}`);
    request.send();
  };

  if (!folder()) { throw('Could not find the file list element. Did you run this script before the page rendered?'); }

  /* only new files are reported */
  folder().querySelectorAll(filesSelector).forEach((element) => { filesByName.push(element.innerHTML); });

  let timer = setInterval(() => {
    let files = folder().querySelectorAll(filesSelector);
    files.forEach((element) => {
      let fileName = element.innerHTML;
      if (fileName && !filesByName.includes(fileName)) {
        getFn(`sync?fileName=${encodeURIComponent(fileName)}&ts=${new Date().getTime()}`);
        filesByName.push(fileName);
        console.log(`Detected new file: '${fileName}' at ${new Date()}`);
      }
    });
    if ((files.length === 0) && (filesByName.length !== 0)) {
      filesByName = [];
      getFn('empty');
    }
  }, 100);

  function stopPerfTimer() {
    if (timer) { clearInterval(timer); }
    console.log('Stopped performance timer.');
  };
  if (document.stopPerfTimer) { document.stopPerfTimer(); }
  document.stopPerfTimer = stopPerfTimer;

  getFn('ready');
  console.log('Now monitoring files and their create timestamps. Run `document.stopPerfTimer()` when done');
})();"#;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("no browser opener succeeded for {0}")]
    NoOpener(String),
}

/// Console script for the provider's web view, reporting to `callback_base`.
pub fn render_script(kind: ProviderKind, callback_base: &str) -> String {
    let template = match kind {
        ProviderKind::Dropbox => DROPBOX_SCRIPT,
        ProviderKind::GoogleDrive => DRIVE_SCRIPT,
    };
    template.replace(CALLBACK_PLACEHOLDER, callback_base.trim_end_matches('/'))
}

const CLIPBOARD_TOOLS: &[(&str, &[&str])] = &[
    ("wl-copy", &[]),
    ("xclip", &["-selection", "clipboard"]),
    ("pbcopy", &[]),
];

/// Best-effort copy; returns the tool that accepted the text.
pub fn copy_to_clipboard(text: &str) -> Option<&'static str> {
    for (tool, args) in CLIPBOARD_TOOLS {
        match pipe_to(tool, args, text) {
            Ok(true) => return Some(tool),
            Ok(false) => debug!(tool, "clipboard tool exited with failure"),
            Err(err) => debug!(tool, error = %err, "clipboard tool unavailable"),
        }
    }
    None
}

fn pipe_to(program: &str, args: &[&str], text: &str) -> std::io::Result<bool> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes())?;
    }
    Ok(child.wait()?.success())
}

/// Opens `url` through the desktop portal, falling back to `xdg-open`/`open`.
pub async fn open_in_browser(url: &str) -> Result<(), BrowserError> {
    let parsed = Url::parse(url)?;
    match OpenFileRequest::default().ask(false).send_uri(&parsed).await {
        Ok(_) => return Ok(()),
        Err(err) => warn!(error = %err, "portal open-uri failed, trying command-line openers"),
    }
    for opener in ["xdg-open", "open"] {
        let launched = Command::new(opener)
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if launched {
            return Ok(());
        }
    }
    Err(BrowserError::NoOpener(url.to_string()))
}

pub fn is_yes(answer: &str) -> bool {
    answer
        .trim_start()
        .chars()
        .next()
        .is_some_and(|first| first.eq_ignore_ascii_case(&'y'))
}

/// Asks a `[y/n]` question on the terminal.
pub async fn prompt_yes_no(question: &str) -> Result<bool, BrowserError> {
    println!("{question} [y/n]");
    let answer = read_line().await?;
    Ok(is_yes(&answer))
}

pub async fn wait_for_enter(message: &str) -> Result<(), BrowserError> {
    println!("{message}");
    read_line().await?;
    Ok(())
}

async fn read_line() -> Result<String, BrowserError> {
    let line = tokio::task::spawn_blocking(|| {
        let mut input = String::new();
        std::io::stdin().read_line(&mut input).map(|_| input)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_report_to_the_callback_base() {
        for kind in [ProviderKind::Dropbox, ProviderKind::GoogleDrive] {
            let script = render_script(kind, "https://abc.ngrok.io/");
            assert!(!script.contains(CALLBACK_PLACEHOLDER));
            assert!(script.contains("`https://abc.ngrok.io/${path}`"));
            assert!(script.contains("getFn('ready')"));
            assert!(script.contains("getFn('empty')"));
            assert!(script.contains("sync?fileName="));
        }
    }

    #[test]
    fn scripts_target_provider_markup() {
        assert!(render_script(ProviderKind::Dropbox, "x").contains("data-filename"));
        assert!(render_script(ProviderKind::GoogleDrive, "x").contains("data-is-doc-name"));
    }

    #[test]
    fn yes_answers_start_with_y() {
        assert!(is_yes("y"));
        assert!(is_yes("Yes\n"));
        assert!(is_yes("  yep"));
        assert!(!is_yes("n"));
        assert!(!is_yes(""));
        assert!(!is_yes("okay"));
    }
}
