//! App catalog - Platform-wide app names, cached in the database

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::app::AppId;
use crate::persistence::Database;
use crate::web::{PageFetcher, APP_LIST_URL};

/// Days before the cached catalog is fetched again
pub const CATALOG_MAX_AGE_DAYS: i64 = 10;

#[derive(Debug, Deserialize)]
struct AppListResponse {
    applist: AppList,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<AppListEntry>,
}

#[derive(Debug, Deserialize)]
struct AppListEntry {
    appid: u32,
    #[serde(default)]
    name: String,
}

/// Parse the app list endpoint. Entries without a name are dropped.
pub fn parse_app_list(body: &str) -> Result<HashMap<AppId, String>> {
    let response: AppListResponse =
        serde_json::from_str(body).context("Failed to parse app list")?;
    Ok(response
        .applist
        .apps
        .into_iter()
        .filter(|entry| !entry.name.trim().is_empty())
        .map(|entry| (AppId(entry.appid), entry.name.trim().to_string()))
        .collect())
}

fn is_stale(refreshed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match refreshed_at {
        Some(at) => now - at > TimeDelta::days(CATALOG_MAX_AGE_DAYS),
        None => true,
    }
}

/// App names, refreshed from the platform when the cache is missing or old.
/// A failed refresh falls back to whatever is cached.
pub async fn load_app_names<F: PageFetcher>(
    db: &Database,
    fetcher: &F,
    now: DateTime<Utc>,
) -> Result<HashMap<AppId, String>> {
    let cached = db.load_app_catalog()?;
    let refreshed_at = db.app_catalog_refreshed_at().unwrap_or_else(|e| {
        warn!("Ignoring catalog timestamp: {}", e);
        None
    });

    if !cached.is_empty() && !is_stale(refreshed_at, now) {
        return Ok(cached);
    }

    info!("Refreshing app catalog");
    let fresh = match fetcher.fetch(APP_LIST_URL).await {
        Ok(body) => parse_app_list(&body),
        Err(e) => Err(e.into()),
    };

    match fresh {
        Ok(apps) if !apps.is_empty() => {
            db.save_app_catalog(&apps, now)?;
            info!("App catalog refreshed with {} entries", apps.len());
            Ok(apps)
        }
        Ok(_) => {
            warn!("App list was empty, keeping {} cached entries", cached.len());
            Ok(cached)
        }
        Err(e) => {
            warn!(
                "App catalog refresh failed, keeping {} cached entries: {}",
                cached.len(),
                e
            );
            Ok(cached)
        }
    }
}
