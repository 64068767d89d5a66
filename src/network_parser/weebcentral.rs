//! WeebCentral 页面解析。
//!
//! 页面由服务端渲染，所需元素结构稳定，直接用正则。系列页的第一个 `<h1>` 是标题，
//! `/series/<id>/full-chapter-list` 给出章节链接（最新在前），
//! 章节的 `/images` 片段给出页面 `<img>` 标签。

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use tracing::{debug, warn};

use crate::base_system::context::Config;
use crate::download::fetcher::{Fetch, FetchKind};
use crate::download::models::ChapterNumber;
use crate::download::source::{
    ChapterLister, ImageLister, ListedChapter, ScrapeError, SeriesListing,
};

static H1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").expect("valid regex"));
static CHAPTER_ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*["']([^"']*/chapters/([A-Za-z0-9_-]+))/?["'][^>]*>(.*?)</a>"#)
        .expect("valid regex")
});
static CHAPTER_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:chapter\s*)?(\d+(?:\.\d+)?)").expect("valid regex"));
static IMG_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));
static IMG_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\s(data-src|src)\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

const IMAGES_QUERY: &str = "is_prev=False&current_page=1&reading_style=long_strip";

pub struct WeebCentralParser {
    base_url: String,
    blocked_image_keywords: Vec<String>,
}

impl WeebCentralParser {
    pub fn new(base_url: &str, blocked_image_keywords: &[String]) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            blocked_image_keywords: blocked_image_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.base_url, &config.blocked_image_keywords)
    }

    /// `https://weebcentral.com/series/<id>/<slug>` → `<base>/series/<id>/full-chapter-list`.
    pub fn chapter_list_url(&self, series_url: &str) -> Result<String, ScrapeError> {
        let parsed = Url::parse(series_url)
            .map_err(|e| ScrapeError::failed(series_url, format!("bad url: {e}")))?;
        let parts: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        match parts.as_slice() {
            [kind, id, ..] => Ok(format!("{}/{kind}/{id}/full-chapter-list", self.base_url)),
            _ => Err(ScrapeError::failed(
                series_url,
                "expected a /series/<id>/... url",
            )),
        }
    }

    fn is_blocked(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        self.blocked_image_keywords
            .iter()
            .any(|k| lower.contains(k.as_str()))
    }
}

impl ChapterLister for WeebCentralParser {
    fn list_chapters(
        &self,
        fetcher: &dyn Fetch,
        series_url: &str,
    ) -> Result<SeriesListing, ScrapeError> {
        let series_html = fetch_text(fetcher, series_url)?;
        let title = parse_title(&series_html);
        debug!(target: "parser", ?title, "series page parsed");

        let list_url = self.chapter_list_url(series_url)?;
        let list_html = fetch_text(fetcher, &list_url)?;
        let base = Url::parse(&list_url).map_err(|e| ScrapeError::failed(&list_url, e.to_string()))?;
        let chapters = parse_chapter_list(&list_html, &base);
        if chapters.is_empty() {
            return Err(ScrapeError::failed(&list_url, "no chapter links found"));
        }

        Ok(SeriesListing { title, chapters })
    }
}

impl ImageLister for WeebCentralParser {
    fn list_images(
        &self,
        fetcher: &dyn Fetch,
        chapter_url: &str,
    ) -> Result<Vec<String>, ScrapeError> {
        let base = Url::parse(chapter_url)
            .map_err(|e| ScrapeError::failed(chapter_url, format!("bad url: {e}")))?;

        let images_url = format!("{}/images?{IMAGES_QUERY}", chapter_url.trim_end_matches('/'));
        let mut urls = match fetch_text(fetcher, &images_url) {
            Ok(html) => parse_image_urls(&html, &base),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!(target: "parser", error = %err, "image fragment unavailable, reading chapter page");
                Vec::new()
            }
        };
        if urls.is_empty() {
            let html = fetch_text(fetcher, chapter_url)?;
            urls = parse_image_urls(&html, &base);
        }

        urls.retain(|u| !self.is_blocked(u));
        Ok(urls)
    }
}

fn fetch_text(fetcher: &dyn Fetch, url: &str) -> Result<String, ScrapeError> {
    let bytes = fetcher.fetch(url, FetchKind::Page)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn parse_title(html: &str) -> Option<String> {
    H1_RE
        .captures(html)
        .map(|c| clean_text(&c[1]))
        .filter(|t| !t.is_empty())
}

/// Chapter anchors in reading order (the site lists newest first).
pub fn parse_chapter_list(html: &str, base: &Url) -> Vec<ListedChapter> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in CHAPTER_ANCHOR_RE.captures_iter(html) {
        let id = caps[2].to_string();
        if !seen.insert(id.clone()) {
            continue;
        }
        let text = clean_text(&caps[3]);
        let Some(number) = parse_chapter_number(&text) else {
            if CHAPTER_NUMBER_RE.is_match(&text) {
                warn!(target: "parser", id = %caps[2], %text, "chapter number not representable, chapter skipped");
            } else {
                debug!(target: "parser", %text, "anchor without chapter number skipped");
            }
            continue;
        };
        let Ok(url) = base.join(&caps[1]) else {
            continue;
        };
        out.push(ListedChapter {
            id,
            number,
            url: url.to_string(),
        });
    }
    out.reverse();
    out
}

/// First number in a chapter label: `Chapter 12.5` → `12.5`.
pub fn parse_chapter_number(label: &str) -> Option<ChapterNumber> {
    CHAPTER_NUMBER_RE
        .captures(label)
        .and_then(|c| c[1].parse().ok())
}

/// Page image URLs in document order, absolute, deduplicated, no `data:` URIs.
pub fn parse_image_urls(html: &str, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tag in IMG_TAG_RE.find_iter(html) {
        let mut src = None;
        let mut data_src = None;
        for attr in IMG_SRC_RE.captures_iter(tag.as_str()) {
            let value = decode_entities(attr[2].trim());
            if attr[1].eq_ignore_ascii_case("src") {
                src.get_or_insert(value);
            } else {
                data_src.get_or_insert(value);
            }
        }
        let Some(raw) = src
            .filter(|s| !s.is_empty() && !s.starts_with("data:"))
            .or(data_src.filter(|s| !s.is_empty() && !s.starts_with("data:")))
        else {
            continue;
        };
        let Ok(url) = base.join(&raw) else {
            continue;
        };
        let url = url.to_string();
        if seen.insert(url.clone()) {
            out.push(url);
        }
    }
    out
}

fn clean_text(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
