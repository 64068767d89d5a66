//! 抓取接口：系列页如何变成章节列表，章节页如何变成图片 URL。
//! 具体站点解析器位于 `network_parser`。

use thiserror::Error;

use super::fetcher::{Fetch, FetchError};
use super::models::ChapterNumber;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("could not scrape {url}: {reason}")]
    Failed { url: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ScrapeError {
    pub fn failed(url: &str, reason: impl Into<String>) -> Self {
        Self::Failed {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Cancelled { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedChapter {
    pub id: String,
    pub number: ChapterNumber,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesListing {
    pub title: Option<String>,
    /// In whatever order the site lists them.
    pub chapters: Vec<ListedChapter>,
}

pub trait ChapterLister: Send + Sync {
    fn list_chapters(
        &self,
        fetcher: &dyn Fetch,
        series_url: &str,
    ) -> Result<SeriesListing, ScrapeError>;
}

pub trait ImageLister: Send + Sync {
    /// Image URLs of one chapter, in reading order.
    fn list_images(&self, fetcher: &dyn Fetch, chapter_url: &str)
    -> Result<Vec<String>, ScrapeError>;
}
