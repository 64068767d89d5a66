//! 下载流程共用的数据类型。
//!
//! 章节号、章节选择、任务、单章结果、运行报告与进度事件。

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use thiserror::Error;

// ── ChapterNumber ──────────────────────────────────────────────

/// Fractional digits kept by [`ChapterNumber`].
const SCALE_DIGITS: u32 = 3;
const SCALE: u64 = 10u64.pow(SCALE_DIGITS);

/// Exact decimal chapter number (`5`, `5.5`, `12.25`).
///
/// Stored as thousandths so comparisons never suffer float rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChapterNumber(u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid chapter number: {0:?}")]
pub struct ChapterNumberError(pub String);

impl ChapterNumber {
    pub fn whole(n: u64) -> Self {
        Self(n.saturating_mul(SCALE))
    }

    pub fn integer_part(self) -> u64 {
        self.0 / SCALE
    }

    fn fraction_digits(self) -> Option<String> {
        let frac = self.0 % SCALE;
        if frac == 0 {
            return None;
        }
        let digits = format!("{:0width$}", frac, width = SCALE_DIGITS as usize);
        Some(digits.trim_end_matches('0').to_string())
    }

    /// Zero-padded form used in folder names: `005`, `005.5`.
    pub fn padded(self) -> String {
        match self.fraction_digits() {
            Some(frac) => format!("{:03}.{}", self.integer_part(), frac),
            None => format!("{:03}", self.integer_part()),
        }
    }
}

impl FromStr for ChapterNumber {
    type Err = ChapterNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let err = || ChapterNumberError(s.to_string());

        let (int_part, frac_part) = match raw.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (raw, None),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let whole: u64 = int_part.parse().map_err(|_| err())?;

        let frac = match frac_part {
            None => 0,
            Some(f) => {
                if f.is_empty() || f.len() > SCALE_DIGITS as usize {
                    return Err(err());
                }
                if !f.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(err());
                }
                let value: u64 = f.parse().map_err(|_| err())?;
                value * 10u64.pow(SCALE_DIGITS - f.len() as u32)
            }
        };

        whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac))
            .map(Self)
            .ok_or_else(err)
    }
}

impl fmt::Display for ChapterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fraction_digits() {
            Some(frac) => write!(f, "{}.{}", self.integer_part(), frac),
            None => write!(f, "{}", self.integer_part()),
        }
    }
}

// ── Catalog entries and selection ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterDescriptor {
    pub id: String,
    pub display_number: ChapterNumber,
    pub source_url: String,
    /// Position in the sorted catalog; strictly increasing with the number.
    pub sequence_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterSelection {
    Single(ChapterNumber),
    /// Inclusive on both ends; `low <= high`.
    Range(ChapterNumber, ChapterNumber),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("invalid chapter selection {expr:?}: {reason}")]
    Malformed { expr: String, reason: String },
    #[error("invalid chapter range {low}-{high}: start is after end")]
    Inverted {
        low: ChapterNumber,
        high: ChapterNumber,
    },
}

impl ChapterSelection {
    /// `""` selects everything, `"12"` one chapter, `"3-7.5"` an inclusive range.
    pub fn parse(expr: &str) -> Result<Self, SelectionError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let malformed = |reason: String| SelectionError::Malformed {
            expr: expr.to_string(),
            reason,
        };

        match trimmed.split_once('-') {
            Some((lo, hi)) => {
                let low: ChapterNumber = lo.parse().map_err(|e: ChapterNumberError| malformed(e.to_string()))?;
                let high: ChapterNumber = hi.parse().map_err(|e: ChapterNumberError| malformed(e.to_string()))?;
                if low > high {
                    return Err(SelectionError::Inverted { low, high });
                }
                Ok(Self::Range(low, high))
            }
            None => trimmed
                .parse()
                .map(Self::Single)
                .map_err(|e: ChapterNumberError| malformed(e.to_string())),
        }
    }

    pub fn contains(&self, number: ChapterNumber) -> bool {
        match *self {
            Self::Single(n) => n == number,
            Self::Range(low, high) => low <= number && number <= high,
            Self::All => true,
        }
    }
}

impl fmt::Display for ChapterSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(n) => write!(f, "{n}"),
            Self::Range(low, high) => write!(f, "{low}-{high}"),
            Self::All => f.write_str("all"),
        }
    }
}

// ── Tasks and outcomes ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub chapter: ChapterDescriptor,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    Done { resumed_from_checkpoint: bool },
    /// 0-based indices that could not be downloaded, sorted.
    PartiallyFailed { missing: Vec<usize> },
    Failed { reason: String },
    Cancelled { missing: Vec<usize> },
}

impl ChapterOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::PartiallyFailed { .. } => "partially failed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChapterResult {
    pub chapter: ChapterDescriptor,
    pub outcome: ChapterOutcome,
}

/// Outcome of one `download_series` call.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub series_title: String,
    pub series_dir: PathBuf,
    /// Ordered by `sequence_index`.
    pub results: Vec<ChapterResult>,
    /// Requested chapters absent from the catalog (`"7"`, `"20-25"`).
    pub not_found: Vec<String>,
}

impl RunReport {
    fn matching<'a>(
        &'a self,
        pred: impl Fn(&ChapterOutcome) -> bool + 'a,
    ) -> impl Iterator<Item = &'a ChapterResult> + 'a {
        self.results.iter().filter(move |r| pred(&r.outcome))
    }

    pub fn succeeded(&self) -> Vec<&ChapterResult> {
        self.matching(|o| o.is_done()).collect()
    }

    pub fn partially_failed(&self) -> Vec<&ChapterResult> {
        self.matching(|o| matches!(o, ChapterOutcome::PartiallyFailed { .. }))
            .collect()
    }

    pub fn failed(&self) -> Vec<&ChapterResult> {
        self.matching(|o| matches!(o, ChapterOutcome::Failed { .. }))
            .collect()
    }

    pub fn cancelled(&self) -> Vec<&ChapterResult> {
        self.matching(|o| matches!(o, ChapterOutcome::Cancelled { .. }))
            .collect()
    }

    pub fn all_done(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_done())
    }
}

// ── Progress events ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressKind {
    Queued,
    Started,
    ImageDone { done: usize, total: usize },
    ImageFailed { index: usize },
    Retrying { attempt: u32 },
    Failed { reason: String },
    /// Stopped by a stop request; `missing` pages were not downloaded.
    Cancelled { missing: usize },
    ChapterDone,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub chapter_id: String,
    pub kind: ProgressKind,
    pub detail: String,
    pub at: Instant,
}

impl ProgressEvent {
    pub fn new(chapter_id: impl Into<String>, kind: ProgressKind, detail: impl Into<String>) -> Self {
        Self::at(chapter_id, kind, detail, Instant::now())
    }

    pub fn at(
        chapter_id: impl Into<String>,
        kind: ProgressKind,
        detail: impl Into<String>,
        at: Instant,
    ) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            kind,
            detail: detail.into(),
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> ChapterNumber {
        s.parse().unwrap()
    }

    #[test]
    fn chapter_numbers_compare_exactly() {
        assert_eq!(num("5.50"), num("5.5"));
        assert!(num("5") < num("5.5"));
        assert!(num("10") > num("9.999"));
        assert_eq!(num("12"), ChapterNumber::whole(12));
    }

    #[test]
    fn chapter_numbers_render_without_trailing_zeros() {
        assert_eq!(num("5.50").to_string(), "5.5");
        assert_eq!(num("007").to_string(), "7");
        assert_eq!(num("12.25").padded(), "012.25");
        assert_eq!(num("1234").padded(), "1234");
    }

    #[test]
    fn chapter_number_rejects_garbage() {
        for bad in ["", "abc", "5.", ".5", "1.2345", "-3", "1.2.3"] {
            assert!(bad.parse::<ChapterNumber>().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn selection_parsing() {
        assert_eq!(ChapterSelection::parse("").unwrap(), ChapterSelection::All);
        assert_eq!(ChapterSelection::parse("  ").unwrap(), ChapterSelection::All);
        assert_eq!(
            ChapterSelection::parse("7").unwrap(),
            ChapterSelection::Single(num("7"))
        );
        assert_eq!(
            ChapterSelection::parse("2 - 4.5").unwrap(),
            ChapterSelection::Range(num("2"), num("4.5"))
        );
    }

    #[test]
    fn selection_rejects_inverted_and_malformed_input() {
        assert!(matches!(
            ChapterSelection::parse("5-2"),
            Err(SelectionError::Inverted { .. })
        ));
        assert!(matches!(
            ChapterSelection::parse("two"),
            Err(SelectionError::Malformed { .. })
        ));
        assert!(matches!(
            ChapterSelection::parse("1-"),
            Err(SelectionError::Malformed { .. })
        ));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let sel = ChapterSelection::Range(num("2"), num("4"));
        assert!(sel.contains(num("2")));
        assert!(sel.contains(num("3.5")));
        assert!(sel.contains(num("4")));
        assert!(!sel.contains(num("4.1")));
    }

    #[test]
    fn report_groups_outcomes() {
        let chapter = |i: usize| ChapterDescriptor {
            id: format!("c{i}"),
            display_number: ChapterNumber::whole(i as u64),
            source_url: String::new(),
            sequence_index: i,
        };
        let report = RunReport {
            results: vec![
                ChapterResult {
                    chapter: chapter(0),
                    outcome: ChapterOutcome::Done {
                        resumed_from_checkpoint: false,
                    },
                },
                ChapterResult {
                    chapter: chapter(1),
                    outcome: ChapterOutcome::PartiallyFailed { missing: vec![2] },
                },
                ChapterResult {
                    chapter: chapter(2),
                    outcome: ChapterOutcome::Failed {
                        reason: "boom".into(),
                    },
                },
            ],
            ..RunReport::default()
        };
        assert_eq!(report.succeeded().len(), 1);
        assert_eq!(report.partially_failed().len(), 1);
        assert_eq!(report.failed().len(), 1);
        assert!(report.cancelled().is_empty());
        assert!(!report.all_done());
    }
}
