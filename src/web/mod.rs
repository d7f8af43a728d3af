//! Web scraping - Authenticated requests against the community profile

pub mod parse;
pub mod prices;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::core::settings::WebSession;
use crate::core::AppId;

pub const COMMUNITY_URL: &str = "https://steamcommunity.com";
pub const CARD_PRICE_URL: &str =
    "https://api.enhancedsteam.com/market_data/average_card_prices/?cur=usd&appids=";
pub const APP_LIST_URL: &str = "https://api.steampowered.com/ISteamApps/GetAppList/v2/";

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Errors raised while fetching or reading platform pages
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("empty response")]
    Empty,
    #[error("web session is not authenticated")]
    NotAuthenticated,
    #[error("could not parse {0}")]
    Unparseable(&'static str),
    #[error("no badges found on the profile")]
    NoBadges,
}

/// Something that can fetch a page as text
pub trait PageFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, ScrapeError>> + Send;
}

/// HTTP client carrying the community session cookies
#[derive(Clone)]
pub struct WebClient {
    client: Client,
}

impl WebClient {
    /// Build a client. Cookies are only sent to the community domain.
    pub fn new(session: &WebSession) -> Result<Self, ScrapeError> {
        let jar = Arc::new(Jar::default());
        if session.is_logged_in() {
            let url: Url = COMMUNITY_URL
                .parse()
                .map_err(|_| ScrapeError::Unparseable("community url"))?;
            let mut cookies = vec![
                format!("sessionid={}", session.session_id),
                format!("steamLoginSecure={}", session.steam_login_secure),
            ];
            if let Some(parental) = &session.steam_parental {
                cookies.push(format!("steamparental={}", parental));
            }
            for cookie in cookies {
                jar.add_cookie_str(&format!("{}; Domain=steamcommunity.com; Path=/", cookie), &url);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .cookie_provider(jar)
            .build()?;

        Ok(Self { client })
    }

    /// GET a page and return its body
    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;

        // An expired session is redirected to the login page
        if response.url().path().starts_with("/login") {
            return Err(ScrapeError::NotAuthenticated);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(ScrapeError::Empty);
        }
        Ok(body)
    }
}

impl PageFetcher for WebClient {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, ScrapeError>> + Send {
        let url = url.to_string();
        async move { self.get_text(&url).await }
    }
}

/// Profile URL for a 64-bit account id
pub fn profile_url(steam_id: u64) -> String {
    format!("{}/profiles/{}", COMMUNITY_URL, steam_id)
}

pub fn badges_page_url(profile: &str, page: usize) -> String {
    format!("{}/badges/?p={}", profile, page)
}

pub fn gamecards_url(profile: &str, appid: AppId) -> String {
    format!("{}/gamecards/{}", profile, appid)
}

pub fn card_prices_url(appids: &[AppId]) -> String {
    let ids: Vec<String> = appids.iter().map(|id| id.to_string()).collect();
    format!("{}{}", CARD_PRICE_URL, ids.join(","))
}

/// Keep a raw response for offline inspection. Failures are ignored.
pub fn write_diagnostic(dir: &Path, name: &str, body: &str) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Failed to create diagnostics directory: {}", e);
        return;
    }
    let path = dir.join(name);
    match std::fs::write(&path, body) {
        Ok(()) => debug!("Wrote diagnostic response to {:?}", path),
        Err(e) => warn!("Failed to write diagnostic {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_profile_urls() {
        let profile = profile_url(76561198000000000);
        assert_eq!(profile, "https://steamcommunity.com/profiles/76561198000000000");
        assert_eq!(badges_page_url(&profile, 2), format!("{}/badges/?p=2", profile));
        assert_eq!(gamecards_url(&profile, AppId(730)), format!("{}/gamecards/730", profile));
    }

    #[test]
    fn price_url_joins_ids() {
        let url = card_prices_url(&[AppId(730), AppId(440)]);
        assert!(url.ends_with("appids=730,440"));
    }

    #[test]
    fn diagnostic_write_is_best_effort() {
        let dir = std::env::temp_dir().join(format!("cardboost-diag-{}", std::process::id()));
        write_diagnostic(&dir, "LoadBadges.html", "<html></html>");
        let written = std::fs::read_to_string(dir.join("LoadBadges.html")).unwrap();
        assert_eq!(written, "<html></html>");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
