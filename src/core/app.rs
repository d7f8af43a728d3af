//! Game model - An owned app and its trading-card progress

use serde::{Deserialize, Serialize};

/// Platform identifier of a game
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub u32);

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AppId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(AppId)
    }
}

/// Trading-card progress for one game
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCard {
    /// Recorded playtime in minutes
    pub minutes_played: f64,
    /// Card drops still available
    pub cards_remaining: u32,
    /// Average market price of a card, if known
    pub price: Option<f64>,
}

/// An owned game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub appid: AppId,
    pub name: String,
    pub card: Option<TradeCard>,
}

impl App {
    pub fn new(appid: AppId, name: impl Into<String>) -> Self {
        Self {
            appid,
            name: name.into(),
            card: None,
        }
    }

    pub fn with_card(mut self, card: TradeCard) -> Self {
        self.card = Some(card);
        self
    }

    /// Get the display name, falling back to the app id
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.appid.to_string()
        } else {
            self.name.clone()
        }
    }

    /// "id - name" label used in listings
    pub fn id_and_name(&self) -> String {
        format!("{} - {}", self.appid, self.display_name())
    }

    pub fn cards_remaining(&self) -> u32 {
        self.card.as_ref().map(|c| c.cards_remaining).unwrap_or(0)
    }

    pub fn minutes_played(&self) -> f64 {
        self.card.as_ref().map(|c| c.minutes_played).unwrap_or(0.0)
    }

    pub fn price(&self) -> Option<f64> {
        self.card.as_ref().and_then(|c| c.price)
    }

    /// Whether this game still has cards to drop
    pub fn has_cards(&self) -> bool {
        self.cards_remaining() > 0
    }
}

/// Sort a badge queue by card price, most valuable first. Unpriced games go last.
pub fn sort_by_price_desc(apps: &mut [App]) {
    apps.sort_by(|a, b| {
        let pa = a.price().unwrap_or(f64::NEG_INFINITY);
        let pb = b.price().unwrap_or(f64::NEG_INFINITY);
        pb.total_cmp(&pa)
    });
}
