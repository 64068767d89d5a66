//! 系列 URL → 有序章节列表，以及章节选择过滤。

use std::collections::HashSet;

use thiserror::Error;
use tracing::{info, warn};

use super::fetcher::Fetch;
use super::models::{ChapterDescriptor, ChapterSelection};
use super::source::{ChapterLister, ListedChapter};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("chapter catalog unavailable for {url}: {reason}")]
    Unavailable { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub series_title: String,
    pub series_url: String,
    /// Sorted by number; `sequence_index` is the position in this list.
    pub chapters: Vec<ChapterDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct Selected {
    pub chapters: Vec<ChapterDescriptor>,
    pub not_found: Vec<String>,
}

pub struct ChapterCatalog<'a> {
    pub fetcher: &'a dyn Fetch,
    pub lister: &'a dyn ChapterLister,
}

impl ChapterCatalog<'_> {
    pub fn resolve(&self, series_url: &str) -> Result<Catalog, CatalogError> {
        let url = normalize_series_url(series_url);
        let unavailable = |reason: String| CatalogError::Unavailable {
            url: url.clone(),
            reason,
        };

        let listing = self
            .lister
            .list_chapters(self.fetcher, &url)
            .map_err(|e| unavailable(e.to_string()))?;
        if listing.chapters.is_empty() {
            return Err(unavailable("no chapters found".to_string()));
        }

        let series_title = listing
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback_title(&url));

        let chapters = order_chapters(listing.chapters);
        info!(
            target: "catalog",
            title = %series_title,
            chapters = chapters.len(),
            "catalog resolved"
        );

        Ok(Catalog {
            series_title,
            series_url: url,
            chapters,
        })
    }
}

/// Sorts by number and assigns sequence indices. The first entry wins when a
/// number is listed twice.
fn order_chapters(mut listed: Vec<ListedChapter>) -> Vec<ChapterDescriptor> {
    // stable sort keeps site order among equal numbers
    listed.sort_by_key(|c| c.number);

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(listed.len());
    for chapter in listed {
        if !seen.insert(chapter.number) {
            warn!(
                target: "catalog",
                number = %chapter.number,
                id = %chapter.id,
                "duplicate chapter number, keeping the first entry"
            );
            continue;
        }
        out.push(ChapterDescriptor {
            sequence_index: out.len(),
            id: chapter.id,
            display_number: chapter.number,
            source_url: chapter.url,
        });
    }
    out
}

pub fn filter(catalog: &Catalog, selection: &ChapterSelection) -> Selected {
    let chapters: Vec<ChapterDescriptor> = catalog
        .chapters
        .iter()
        .filter(|c| selection.contains(c.display_number))
        .cloned()
        .collect();

    let mut not_found = Vec::new();
    if chapters.is_empty() && *selection != ChapterSelection::All {
        warn!(target: "catalog", requested = %selection, "requested chapters not in catalog");
        not_found.push(selection.to_string());
    }

    Selected {
        chapters,
        not_found,
    }
}

/// Prepends `https://` when the URL has no scheme.
pub fn normalize_series_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    }
}

/// Last path segment of the series URL (`.../series/01J76XY/One-Piece` → `One-Piece`).
fn fallback_title(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|s| s.filter(|p| !p.is_empty()).last().map(str::to_string))
        })
        .unwrap_or_else(|| "Unknown Series".to_string())
}
