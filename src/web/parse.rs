//! Badge page parsing
//!
//! The community pages are matched with a handful of regular expressions
//! rather than a full DOM: only a few class names are read and the markup
//! around them has been stable for years.

use std::collections::HashSet;

use regex::Regex;

use crate::core::AppId;

/// One row of the badge listing
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeRow {
    pub appid: AppId,
    /// Text of the badge title, if present
    pub title: Option<String>,
    pub cards_remaining: u32,
    /// `None` when the playtime text is missing or malformed
    pub minutes_played: Option<f64>,
}

/// Compiled patterns for the badge and game-card pages
pub struct PageParser {
    row_start: Regex,
    overlay_appid: Regex,
    playtime: Regex,
    progress: Regex,
    title: Regex,
    pagelink: Regex,
    digits: Regex,
    hours: Regex,
}

impl PageParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            row_start: Regex::new(r#"<div\s+class="badge_row is_link""#)?,
            overlay_appid: Regex::new(
                r#"class="badge_row_overlay"[^>]*href="[^"]*gamecards/(\d+)/"#,
            )?,
            playtime: Regex::new(r#"class="badge_title_stats_playtime"[^>]*>([^<]*)<"#)?,
            progress: Regex::new(r#"class="progress_info_bold"[^>]*>([^<]*)<"#)?,
            title: Regex::new(r#"class="badge_title"[^>]*>([^<]*)"#)?,
            pagelink: Regex::new(r#"<a\s+class="pagelink"\s+href="([^"]*)""#)?,
            digits: Regex::new(r"\d+")?,
            hours: Regex::new(r"\d[\d.,]*")?,
        })
    }

    /// Total number of listing pages, counting the current one
    pub fn page_count(&self, html: &str) -> usize {
        let links: HashSet<&str> = self
            .pagelink
            .captures_iter(html)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        links.len() + 1
    }

    /// Parse every badge row that carries a game id and a progress counter
    pub fn badge_rows(&self, html: &str) -> Vec<BadgeRow> {
        let starts: Vec<usize> = self.row_start.find_iter(html).map(|m| m.start()).collect();

        let mut rows = Vec::new();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(html.len());
            if let Some(row) = self.parse_row(&html[start..end]) {
                rows.push(row);
            }
        }
        rows
    }

    fn parse_row(&self, segment: &str) -> Option<BadgeRow> {
        let appid = self
            .overlay_appid
            .captures(segment)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map(AppId)?;

        let progress = self.capture_text(&self.progress, segment)?;
        let cards_remaining = self.leading_count(&progress);

        let minutes_played = self
            .capture_text(&self.playtime, segment)
            .and_then(|text| self.hours_to_minutes(&text));

        let title = self
            .capture_text(&self.title, segment)
            .map(|t| decode_entities(&t));

        Some(BadgeRow {
            appid,
            title: title.filter(|t| !t.is_empty()),
            cards_remaining,
            minutes_played,
        })
    }

    /// Remaining drops on a single game-card page.
    /// `None` when the progress element is missing entirely.
    pub fn cards_remaining(&self, html: &str) -> Option<u32> {
        self.capture_text(&self.progress, html)
            .map(|text| self.leading_count(&text))
    }

    /// First number in a counter text; anything unreadable counts as zero
    fn leading_count(&self, text: &str) -> u32 {
        self.digits
            .find(text)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    }

    fn hours_to_minutes(&self, text: &str) -> Option<f64> {
        let raw = self.hours.find(text)?.as_str().replace(',', "");
        let hours: f64 = raw.trim_end_matches('.').parse().ok()?;
        Some(hours * 60.0)
    }

    fn capture_text(&self, pattern: &Regex, haystack: &str) -> Option<String> {
        pattern
            .captures(haystack)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .trim()
        .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn badge_row_html(appid: u32, progress: &str, playtime: &str) -> String {
        format!(
            r#"<div class="badge_row is_link">
                <a class="badge_row_overlay" href="https://steamcommunity.com/id/someone/gamecards/{appid}/"></a>
                <div class="badge_title_row">
                    <div class="badge_title_stats_playtime">&nbsp;{playtime}</div>
                    <div class="badge_title">Game&nbsp;{appid}&nbsp;<span class="badge_view_details">View details</span></div>
                </div>
                <span class="progress_info_bold">{progress}</span>
            </div>"#
        )
    }

    pub(crate) fn badge_page(rows: &[String], pages: usize) -> String {
        let links: String = (2..=pages)
            .map(|p| format!(r#"<a class="pagelink" href="?p={p}">{p}</a>"#))
            .collect();
        format!(
            "<html><body><div class=\"pageLinks\">{links}{links}</div>{}</body></html>",
            rows.concat()
        )
    }

    #[test]
    fn counts_distinct_page_links() {
        let parser = PageParser::new().unwrap();
        assert_eq!(parser.page_count(&badge_page(&[], 3)), 3);
        assert_eq!(parser.page_count("<html></html>"), 1);
    }

    #[test]
    fn parses_rows() {
        let parser = PageParser::new().unwrap();
        let html = badge_page(
            &[
                badge_row_html(730, "3 card drops remaining", "1,234.5 hrs on record"),
                badge_row_html(440, "No card drops remaining", "0.2 hrs on record"),
            ],
            1,
        );
        let rows = parser.badge_rows(&html);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].appid, AppId(730));
        assert_eq!(rows[0].cards_remaining, 3);
        assert_eq!(rows[0].minutes_played, Some(1234.5 * 60.0));
        assert_eq!(rows[0].title.as_deref(), Some("Game 730"));
        assert_eq!(rows[1].cards_remaining, 0);
    }

    #[test]
    fn malformed_counts_and_hours() {
        let parser = PageParser::new().unwrap();
        let html = badge_row_html(570, "card drops remaining", "hrs on record");
        let rows = parser.badge_rows(&html);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cards_remaining, 0);
        assert_eq!(rows[0].minutes_played, None);
    }

    #[test]
    fn skips_rows_without_progress_or_id() {
        let parser = PageParser::new().unwrap();
        let no_progress = r#"<div class="badge_row is_link">
            <a class="badge_row_overlay" href="https://steamcommunity.com/id/x/gamecards/10/"></a>
        </div>"#;
        let no_id = r#"<div class="badge_row is_link">
            <a class="badge_row_overlay" href="https://steamcommunity.com/id/x/badges/2"></a>
            <span class="progress_info_bold">2 card drops remaining</span>
        </div>"#;
        assert!(parser.badge_rows(&format!("{no_progress}{no_id}")).is_empty());
    }

    #[test]
    fn reads_single_game_progress() {
        let parser = PageParser::new().unwrap();
        let page = r#"<div><span class="progress_info_bold">2 card drops remaining</span></div>"#;
        assert_eq!(parser.cards_remaining(page), Some(2));
        let done = r#"<span class="progress_info_bold">No card drops remaining</span>"#;
        assert_eq!(parser.cards_remaining(done), Some(0));
        assert_eq!(parser.cards_remaining("<html>Sign in</html>"), None);
    }
}
