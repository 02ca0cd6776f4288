//! Resolving module locators to bytes.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{BridgeError, Result};

/// Where module bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// An `http://` or `https://` URL.
    Url(String),
}

impl Locator {
    /// Parse a locator string. `http(s)://` becomes a URL, `file://` and
    /// anything else a path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Self::Url(s.to_string())
        } else if let Some(path) = s.strip_prefix("file://") {
            Self::Path(PathBuf::from(path))
        } else {
            Self::Path(PathBuf::from(s))
        }
    }

    /// Display name used in errors and logs.
    pub fn name(&self) -> String {
        match self {
            Self::Path(p) => p.display().to_string(),
            Self::Url(u) => u.clone(),
        }
    }
}

impl From<&Path> for Locator {
    fn from(p: &Path) -> Self {
        Self::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for Locator {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

/// Fetch the bytes behind a locator. Every failure is a compile error: the
/// module could not be obtained in compilable form.
pub async fn fetch(locator: &Locator, timeout: Duration) -> Result<Vec<u8>> {
    let name = locator.name();
    let fail = |cause: String| BridgeError::Compile {
        module: name.clone(),
        cause,
    };
    match locator {
        Locator::Path(path) => tokio::fs::read(path)
            .await
            .map_err(|e| fail(format!("failed to read file: {}", e))),
        Locator::Url(url) => {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| fail(format!("failed to build HTTP client: {}", e)))?;
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| fail(format!("request failed: {}", e)))?;
            let status = response.status();
            if !status.is_success() {
                return Err(fail(format!("server returned {}", status)));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| fail(format!("failed to read body: {}", e)))?;
            Ok(bytes.to_vec())
        }
    }
}
