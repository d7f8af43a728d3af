//! Badge catalog - Scrapes card progress from the profile's badge pages

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use super::app::{App, AppId, TradeCard};
use crate::web::parse::{BadgeRow, PageParser};
use crate::web::prices::parse_prices;
use crate::web::{self, PageFetcher, ScrapeError};

/// Source of card progress used by the orchestrator
pub trait BadgeSource: Send + Sync + 'static {
    /// Every game with cards left to drop, minus the blacklist
    fn load_badges(
        &self,
        blacklist: HashSet<AppId>,
    ) -> impl Future<Output = Result<Vec<App>, ScrapeError>> + Send;

    /// Remaining drops for a single game
    fn cards_remaining(&self, appid: AppId)
        -> impl Future<Output = Result<u32, ScrapeError>> + Send;
}

/// Scrapes the profile badge listing
pub struct BadgeCatalog<F: PageFetcher> {
    fetcher: F,
    parser: PageParser,
    profile_url: String,
    /// Owned app names, keyed by id
    names: Arc<HashMap<AppId, String>>,
    /// Last parsed playtime per app, kept when a later page has unreadable hours
    known_minutes: RwLock<HashMap<AppId, f64>>,
    diagnostics_dir: PathBuf,
}

impl<F: PageFetcher> BadgeCatalog<F> {
    pub fn new(
        fetcher: F,
        profile_url: impl Into<String>,
        names: Arc<HashMap<AppId, String>>,
        diagnostics_dir: PathBuf,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            fetcher,
            parser: PageParser::new()?,
            profile_url: profile_url.into(),
            names,
            known_minutes: RwLock::new(HashMap::new()),
            diagnostics_dir,
        })
    }

    /// Scrape every badge page, then merge prices
    pub async fn fetch_badges(&self, blacklist: &HashSet<AppId>) -> Result<Vec<App>, ScrapeError> {
        info!("Loading badges");

        let first_url = web::badges_page_url(&self.profile_url, 1);
        let first_page = self.fetcher.fetch(&first_url).await?;

        let pages = self.parser.page_count(&first_page);
        let mut apps = self.rows_to_apps(self.parser.badge_rows(&first_page));
        info!("Processed {} badges from page 1 of {}", apps.len(), pages);

        // Later pages are optional: a broken page only costs its own rows
        for page in 2..=pages {
            let url = web::badges_page_url(&self.profile_url, page);
            match self.fetcher.fetch(&url).await {
                Ok(html) => {
                    let found = self.rows_to_apps(self.parser.badge_rows(&html));
                    info!("Processed {} badges from page {}", found.len(), page);
                    apps.extend(found);
                }
                Err(e) => warn!("Skipping badge page {}: {}", page, e),
            }
        }

        if apps.is_empty() {
            warn!("No badges were parsed, the profile page is probably not what we expected");
            web::write_diagnostic(&self.diagnostics_dir, "LoadBadges.html", &first_page);
            return Err(ScrapeError::NoBadges);
        }

        self.merge_prices(&mut apps).await;

        Ok(apps
            .into_iter()
            .filter(|app| app.has_cards() && !blacklist.contains(&app.appid))
            .collect())
    }

    /// Scrape the game-card page of one app
    pub async fn fetch_cards_remaining(&self, appid: AppId) -> Result<u32, ScrapeError> {
        let url = web::gamecards_url(&self.profile_url, appid);
        let html = self.fetcher.fetch(&url).await?;
        match self.parser.cards_remaining(&html) {
            Some(count) => {
                debug!("App {} has {} card drops left", appid, count);
                Ok(count)
            }
            None => {
                warn!("Could not read remaining cards for app {}", appid);
                web::write_diagnostic(&self.diagnostics_dir, "UpdateCurrentCard.html", &html);
                Err(ScrapeError::Unparseable("game card page"))
            }
        }
    }

    fn rows_to_apps(&self, rows: Vec<BadgeRow>) -> Vec<App> {
        let mut known = match self.known_minutes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        rows.into_iter()
            .map(|row| {
                let minutes_played = match row.minutes_played {
                    Some(minutes) => {
                        known.insert(row.appid, minutes);
                        minutes
                    }
                    None => known.get(&row.appid).copied().unwrap_or(0.0),
                };
                let name = self
                    .names
                    .get(&row.appid)
                    .cloned()
                    .or(row.title)
                    .unwrap_or_else(|| row.appid.to_string());

                App::new(row.appid, name).with_card(TradeCard {
                    minutes_played,
                    cards_remaining: row.cards_remaining,
                    price: None,
                })
            })
            .collect()
    }

    async fn merge_prices(&self, apps: &mut [App]) {
        let ids: Vec<AppId> = apps.iter().map(|a| a.appid).collect();
        let body = match self.fetcher.fetch(&web::card_prices_url(&ids)).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Card price lookup failed: {}", e);
                return;
            }
        };

        let prices = match parse_prices(&body) {
            Ok(prices) => prices,
            Err(e) => {
                warn!("Card price response was not understood: {}", e);
                return;
            }
        };

        for app in apps.iter_mut() {
            if let (Some(price), Some(card)) = (prices.get(&app.appid), app.card.as_mut()) {
                card.price = Some(*price);
            }
        }
        debug!("Merged {} card prices", prices.len());
    }
}

impl<F: PageFetcher> BadgeSource for BadgeCatalog<F> {
    fn load_badges(
        &self,
        blacklist: HashSet<AppId>,
    ) -> impl Future<Output = Result<Vec<App>, ScrapeError>> + Send {
        async move { self.fetch_badges(&blacklist).await }
    }

    fn cards_remaining(
        &self,
        appid: AppId,
    ) -> impl Future<Output = Result<u32, ScrapeError>> + Send {
        self.fetch_cards_remaining(appid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::parse::tests::{badge_page, badge_row_html};

    const PROFILE: &str = "https://steamcommunity.com/profiles/1";

    /// Serves canned pages keyed by URL
    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, Result<String, u16>>,
        prices: Option<String>,
    }

    impl FakeFetcher {
        fn page(mut self, n: usize, body: Result<String, u16>) -> Self {
            self.pages.insert(web::badges_page_url(PROFILE, n), body);
            self
        }
    }

    impl PageFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> impl Future<Output = Result<String, ScrapeError>> + Send {
            let result = if url.starts_with(web::CARD_PRICE_URL) {
                self.prices.clone().ok_or(ScrapeError::Status(503))
            } else {
                match self.pages.get(url) {
                    Some(Ok(body)) => Ok(body.clone()),
                    Some(Err(status)) => Err(ScrapeError::Status(*status)),
                    None => Err(ScrapeError::Status(404)),
                }
            };
            async move { result }
        }
    }

    fn catalog(fetcher: FakeFetcher) -> BadgeCatalog<FakeFetcher> {
        let mut names = HashMap::new();
        names.insert(AppId(730), "Counter-Strike 2".to_string());
        let dir = std::env::temp_dir().join(format!("cardboost-badges-{}", std::process::id()));
        BadgeCatalog::new(fetcher, PROFILE, Arc::new(names), dir).unwrap()
    }

    fn row(appid: u32, cards: u32) -> String {
        badge_row_html(appid, &format!("{cards} card drops remaining"), "2.5 hrs on record")
    }

    #[tokio::test]
    async fn failed_middle_page_is_skipped() {
        let fetcher = FakeFetcher::default()
            .page(1, Ok(badge_page(&[row(730, 2)], 3)))
            .page(2, Err(500))
            .page(3, Ok(badge_page(&[row(440, 1)], 3)));
        let catalog = catalog(fetcher);

        let apps = catalog.fetch_badges(&HashSet::new()).await.unwrap();
        let ids: Vec<AppId> = apps.iter().map(|a| a.appid).collect();
        assert_eq!(ids, vec![AppId(730), AppId(440)]);
        assert_eq!(apps[0].name, "Counter-Strike 2");
        assert_eq!(apps[1].name, "Game 440");
        assert_eq!(apps[0].minutes_played(), 150.0);
    }

    #[tokio::test]
    async fn first_page_failure_fails_the_load() {
        let catalog = catalog(FakeFetcher::default().page(1, Err(502)));
        assert!(matches!(
            catalog.fetch_badges(&HashSet::new()).await,
            Err(ScrapeError::Status(502))
        ));
    }

    #[tokio::test]
    async fn zero_badges_is_an_error() {
        let catalog = catalog(FakeFetcher::default().page(1, Ok(badge_page(&[], 1))));
        assert!(matches!(
            catalog.fetch_badges(&HashSet::new()).await,
            Err(ScrapeError::NoBadges)
        ));
    }

    #[tokio::test]
    async fn finished_and_blacklisted_games_are_filtered() {
        let fetcher = FakeFetcher::default().page(
            1,
            Ok(badge_page(&[row(730, 0), row(440, 3), row(570, 1)], 1)),
        );
        let catalog = catalog(fetcher);
        let blacklist: HashSet<AppId> = [AppId(570)].into_iter().collect();

        let apps = catalog.fetch_badges(&blacklist).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].appid, AppId(440));
        assert!(apps.iter().all(|a| a.cards_remaining() > 0));
    }

    #[tokio::test]
    async fn prices_merge_onto_matching_apps_only() {
        let mut fetcher =
            FakeFetcher::default().page(1, Ok(badge_page(&[row(730, 2), row(999, 4)], 1)));
        fetcher.prices = Some(r#"{"730": 0.12, "440": 0.05}"#.to_string());
        let catalog = catalog(fetcher);

        let apps = catalog.fetch_badges(&HashSet::new()).await.unwrap();
        let by_id: HashMap<AppId, &App> = apps.iter().map(|a| (a.appid, a)).collect();
        assert_eq!(by_id[&AppId(730)].price(), Some(0.12));
        assert_eq!(by_id[&AppId(999)].price(), None);
    }

    #[tokio::test]
    async fn price_failure_leaves_prices_unset() {
        let catalog = catalog(FakeFetcher::default().page(1, Ok(badge_page(&[row(730, 2)], 1))));
        let apps = catalog.fetch_badges(&HashSet::new()).await.unwrap();
        assert_eq!(apps[0].price(), None);
    }

    #[tokio::test]
    async fn unreadable_hours_keep_previous_minutes() {
        let good = FakeFetcher::default().page(1, Ok(badge_page(&[row(730, 2)], 1)));
        let catalog = catalog(good);
        catalog.fetch_badges(&HashSet::new()).await.unwrap();

        let broken = badge_row_html(730, "2 card drops remaining", "hrs on record");
        let rows = catalog.parser.badge_rows(&badge_page(&[broken], 1));
        let apps = catalog.rows_to_apps(rows);
        assert_eq!(apps[0].minutes_played(), 150.0);
    }

    #[tokio::test]
    async fn reads_single_game_progress() {
        let mut fetcher = FakeFetcher::default();
        fetcher.pages.insert(
            web::gamecards_url(PROFILE, AppId(730)),
            Ok(r#"<span class="progress_info_bold">1 card drop remaining</span>"#.to_string()),
        );
        fetcher.pages.insert(
            web::gamecards_url(PROFILE, AppId(440)),
            Ok("<html>unexpected</html>".to_string()),
        );
        let catalog = catalog(fetcher);

        assert_eq!(catalog.fetch_cards_remaining(AppId(730)).await.unwrap(), 1);
        assert!(matches!(
            catalog.fetch_cards_remaining(AppId(440)).await,
            Err(ScrapeError::Unparseable(_))
        ));
    }
}
