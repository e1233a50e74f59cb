//! Remote build catalog: fetching and parsing the experimental build
//! listing.
//!
//! The build server exposes a plain HTML table per graphics/platform
//! combination. Each row carries an anchor to the build archive and a
//! timestamp cell. Rows are normalized so index 0 is always the newest
//! build, whatever order the server lists them in.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

/// Graphics flavor of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Graphics {
    Tiles,
    Console,
}

impl Graphics {
    pub fn label(&self) -> &'static str {
        match self {
            Graphics::Tiles => "Tiles",
            Graphics::Console => "Console",
        }
    }
}

/// Target platform of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    X64,
    X86,
}

impl Platform {
    pub fn label(&self) -> &'static str {
        match self {
            Platform::X64 => "x64",
            Platform::X86 => "x86",
        }
    }
}

/// Listing URL for a graphics/platform combination.
pub fn listing_url(graphics: Graphics, platform: Platform) -> &'static str {
    match (graphics, platform) {
        (Graphics::Tiles, Platform::X64) => {
            "http://dev.narc.ro/cataclysm/jenkins-latest/Windows_x64/Tiles/"
        }
        (Graphics::Tiles, Platform::X86) => {
            "http://dev.narc.ro/cataclysm/jenkins-latest/Windows/Tiles/"
        }
        (Graphics::Console, Platform::X64) => {
            "http://dev.narc.ro/cataclysm/jenkins-latest/Windows_x64/Curses/"
        }
        (Graphics::Console, Platform::X86) => {
            "http://dev.narc.ro/cataclysm/jenkins-latest/Windows/Curses/"
        }
    }
}

/// One remote build. Immutable once parsed; the whole sequence is
/// replaced on refresh.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Build {
    /// Build number parsed out of the archive name; absent when the
    /// name does not follow the usual pattern.
    pub number: Option<String>,
    pub name: String,
    pub url: String,
    pub date: Option<DateTime<Utc>>,
}

static BUILD_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"cataclysmdda-[01]\.[A-F]-(?P<build>\d+)").expect("build number pattern is valid")
});

/// Fetch and parse the build listing for the given variant.
pub async fn fetch_builds(
    client: &reqwest::Client,
    graphics: Graphics,
    platform: Platform,
) -> Result<Vec<Build>> {
    let url = listing_url(graphics, platform);
    info!("fetching build listing: {url}");
    let html = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch build listing: {url}"))?
        .error_for_status()
        .with_context(|| format!("Build listing request failed: {url}"))?
        .text()
        .await
        .context("Failed to read build listing body")?;

    let builds = parse_build_listing(&html, url)?;
    debug!("parsed {} builds", builds.len());
    Ok(builds)
}

/// Parse the listing table, newest build first.
pub fn parse_build_listing(html: &str, base_url: &str) -> Result<Vec<Build>> {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse("tr").map_err(|e| anyhow!("bad selector: {e}"))?;
    let cell_selector = Selector::parse("td").map_err(|e| anyhow!("bad selector: {e}"))?;
    let anchor_selector = Selector::parse("a").map_err(|e| anyhow!("bad selector: {e}"))?;
    let base = Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;

    let mut builds = Vec::new();
    for row in document.select(&row_selector) {
        let mut name = None;
        let mut url = None;
        let mut number = None;
        let mut date = None;

        for (index, cell) in row.select(&cell_selector).enumerate() {
            match index {
                1 => {
                    if let Some((anchor_name, anchor_url)) = parse_anchor(&cell, &base, &anchor_selector) {
                        number = BUILD_NUMBER
                            .captures(&anchor_name)
                            .map(|captures| captures["build"].to_string());
                        name = Some(anchor_name);
                        url = Some(anchor_url);
                    }
                }
                2 => {
                    let text = cell.text().collect::<String>();
                    let text = text.trim();
                    if !text.is_empty() {
                        date = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M")
                            .ok()
                            .map(|naive| naive.and_utc());
                    }
                }
                _ => {}
            }
        }

        if let (Some(name), Some(url)) = (name, url) {
            builds.push(Build {
                number,
                name,
                url,
                date,
            });
        }
    }

    // The server lists rows chronologically; flip them, then let a
    // stable date sort settle listings that already arrive newest-first.
    builds.reverse();
    builds.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(builds)
}

fn parse_anchor(
    cell: &ElementRef,
    base: &Url,
    anchor_selector: &Selector,
) -> Option<(String, String)> {
    let anchor = cell.select(anchor_selector).next()?;
    let name = anchor.text().collect::<String>();
    if !name.starts_with("cataclysmdda") {
        return None;
    }
    let href = anchor.value().attr("href")?;
    let url = base.join(href).ok()?;
    Some((name, url.to_string()))
}
