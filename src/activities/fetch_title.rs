use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::config::ActivityConfig;
use crate::runtime::{ActivityContext, ActivityHandler};

/// Result text when a page has no matching title.
pub const NO_TITLE: &str = "No title found";

const TITLE_PATTERN: &str = r"(?i)<title[^>]*>([^<]+?)\s*\|\s*Microsoft Learn</title>";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static TITLE_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

/// First `<title>… | Microsoft Learn</title>` text in `content`, trimmed.
pub fn extract_title(content: &str) -> Option<String> {
    let regex = TITLE_REGEX.get_or_init(|| Regex::new(TITLE_PATTERN).ok()).as_ref()?;
    let captures = regex.captures(content)?;
    Some(captures.get(1)?.as_str().trim().to_string())
}

/// Waits a random delay, then fetches one page and extracts its title.
///
/// Fetch failures are part of the result text, never an activity error.
#[derive(Clone)]
pub struct FetchTitleActivity {
    config: ActivityConfig,
    client: reqwest::Client,
}

impl FetchTitleActivity {
    pub fn new(config: ActivityConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(config, client)
    }

    pub fn with_client(config: ActivityConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    async fn fetch_body(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client.get(url).send().await?.error_for_status()?.text().await
    }

    /// Title of `url`, [`NO_TITLE`], or a description of the fetch failure.
    pub async fn fetch_title(&self, url: &str) -> String {
        match self.fetch_body(url).await {
            Ok(body) => extract_title(&body).unwrap_or_else(|| NO_TITLE.to_string()),
            Err(e) => format!("Error fetching from {url}: {e}"),
        }
    }
}

#[async_trait]
impl ActivityHandler for FetchTitleActivity {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        let delay = self.config.sample_delay();
        ctx.trace_info(format!("Delaying {}s before fetching: {input}", delay.as_secs()));
        tokio::time::sleep(delay).await;

        ctx.trace_info(format!("Fetching from url {input}."));
        let title = self.fetch_title(&input).await;
        if title.starts_with("Error fetching from") {
            ctx.trace_warn(&title);
        }
        Ok(title)
    }
}
