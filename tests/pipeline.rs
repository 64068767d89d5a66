//! End-to-end pipeline runs against an in-memory site.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weebcentral_manga_downloader::base_system::context::Config;
use weebcentral_manga_downloader::base_system::series_paths::series_folder_name;
use weebcentral_manga_downloader::download::checkpoint::CheckpointStore;
use weebcentral_manga_downloader::download::fetcher::{Fetch, FetchError, FetchKind};
use weebcentral_manga_downloader::download::models::{
    ChapterOutcome, ChapterSelection, ProgressEvent, ProgressKind, RunReport,
};
use weebcentral_manga_downloader::download::progress::{
    CallbackReporter, ChannelReporter, NullReporter, ProgressReporter,
};
use weebcentral_manga_downloader::download::source::{
    ChapterLister, ImageLister, ListedChapter, ScrapeError, SeriesListing,
};
use weebcentral_manga_downloader::download::{
    DownloadRequest, PipelineError, RunContext, download_series,
};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR fake page";
const TITLE: &str = "Fake Series";
const SERIES_URL: &str = "https://fake.test/series/1/fake";

type FetchHook = Box<dyn Fn(&str) + Send + Sync>;

/// Chapters `1..=n`, each with `pages` images.
struct FakeSite {
    chapters: Vec<(String, String, usize)>,
    failing: Mutex<HashSet<String>>,
    /// Urls that fail once, through the retry callback, before succeeding.
    flaky: Mutex<HashSet<String>>,
    /// Runs after every successful image fetch.
    after_fetch: Option<FetchHook>,
    panicking_chapter: Option<String>,
    latency: Duration,
    image_fetches: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
}

impl FakeSite {
    fn new(count: usize, pages: usize) -> Self {
        Self {
            chapters: (1..=count)
                .map(|n| (format!("c{n}"), n.to_string(), pages))
                .collect(),
            failing: Mutex::new(HashSet::new()),
            flaky: Mutex::new(HashSet::new()),
            after_fetch: None,
            panicking_chapter: None,
            latency: Duration::ZERO,
            image_fetches: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        }
    }

    fn image_url(chapter_id: &str, index: usize) -> String {
        format!("https://img.test/{chapter_id}/{index}.png")
    }

    fn chapter_url(chapter_id: &str) -> String {
        format!("https://fake.test/chapters/{chapter_id}")
    }

    fn fail_image(&self, chapter_id: &str, index: usize) {
        self.failing
            .lock()
            .unwrap()
            .insert(Self::image_url(chapter_id, index));
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn fetched(&self) -> Vec<String> {
        self.image_fetches.lock().unwrap().clone()
    }

    fn network_calls(&self) -> usize {
        self.fetched().len() + self.list_calls.load(Ordering::SeqCst)
    }

    fn reset_counters(&self) {
        self.image_fetches.lock().unwrap().clear();
        self.list_calls.store(0, Ordering::SeqCst);
    }
}

impl Fetch for FakeSite {
    fn fetch_observed(
        &self,
        url: &str,
        _kind: FetchKind<'_>,
        on_retry: &dyn Fn(u32, &FetchError),
    ) -> Result<Vec<u8>, FetchError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.image_fetches.lock().unwrap().push(url.to_string());
        if self.failing.lock().unwrap().contains(url) {
            return Err(FetchError::Failed {
                url: url.to_string(),
                attempts: 3,
                last_error: "HTTP 503 Service Unavailable".to_string(),
            });
        }
        if self.flaky.lock().unwrap().remove(url) {
            on_retry(
                2,
                &FetchError::Failed {
                    url: url.to_string(),
                    attempts: 1,
                    last_error: "HTTP 502 Bad Gateway".to_string(),
                },
            );
        }
        if let Some(hook) = &self.after_fetch {
            hook(url);
        }
        Ok(PNG.to_vec())
    }
}

impl ChapterLister for FakeSite {
    fn list_chapters(
        &self,
        _fetcher: &dyn Fetch,
        series_url: &str,
    ) -> Result<SeriesListing, ScrapeError> {
        if series_url.contains("missing") {
            return Err(ScrapeError::failed(series_url, "HTTP 404"));
        }
        Ok(SeriesListing {
            title: Some(TITLE.to_string()),
            // newest first, like the real site
            chapters: self
                .chapters
                .iter()
                .rev()
                .map(|(id, number, _)| ListedChapter {
                    id: id.clone(),
                    number: number.parse().unwrap(),
                    url: Self::chapter_url(id),
                })
                .collect(),
        })
    }
}

impl ImageLister for FakeSite {
    fn list_images(
        &self,
        _fetcher: &dyn Fetch,
        chapter_url: &str,
    ) -> Result<Vec<String>, ScrapeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let (id, _, pages) = self
            .chapters
            .iter()
            .find(|(id, _, _)| Self::chapter_url(id) == chapter_url)
            .ok_or_else(|| ScrapeError::failed(chapter_url, "unknown chapter"))?;
        if self.panicking_chapter.as_deref() == Some(id.as_str()) {
            panic!("parser bug on {id}");
        }
        Ok((0..*pages).map(|i| Self::image_url(id, i)).collect())
    }
}

fn config(workers: usize, delay_seconds: f64) -> Config {
    Config {
        max_workers: workers,
        delay_seconds,
        image_delay_ms: 0,
        ..Config::default()
    }
}

fn context(
    site: &Arc<FakeSite>,
    config: Config,
    reporter: Arc<dyn ProgressReporter>,
) -> RunContext {
    RunContext {
        config,
        fetcher: site.clone(),
        chapter_lister: site.clone(),
        image_lister: site.clone(),
        reporter,
        cancel: Arc::new(AtomicBool::new(false)),
    }
}

fn request(root: &Path, selection: &str) -> DownloadRequest {
    DownloadRequest {
        series_url: SERIES_URL.to_string(),
        selection: ChapterSelection::parse(selection).unwrap(),
        output_root: root.to_path_buf(),
    }
}

fn run(site: &Arc<FakeSite>, root: &Path, selection: &str) -> RunReport {
    let ctx = context(site, config(2, 0.0), Arc::new(NullReporter));
    download_series(&ctx, &request(root, selection)).unwrap()
}

fn outcome_of<'a>(report: &'a RunReport, id: &str) -> &'a ChapterOutcome {
    &report
        .results
        .iter()
        .find(|r| r.chapter.id == id)
        .unwrap()
        .outcome
}

fn series_key() -> String {
    series_folder_name(TITLE)
}

#[test]
fn second_run_makes_no_network_calls() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(3, 2));

    let first = run(&site, dir.path(), "");
    assert!(first.all_done());
    assert_eq!(site.fetched().len(), 6);

    site.reset_counters();
    let second = run(&site, dir.path(), "");
    assert!(second.all_done());
    assert_eq!(site.network_calls(), 0);
    for result in &second.results {
        assert_eq!(
            result.outcome,
            ChapterOutcome::Done {
                resumed_from_checkpoint: true
            }
        );
    }
}

#[test]
fn interrupted_chapter_resumes_missing_pages_only() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(1, 3));

    let store = CheckpointStore::new(dir.path());
    store.begin_chapter(&series_key(), "c1", 3).unwrap();
    store.mark_image_done(&series_key(), "c1", 0).unwrap();
    store.mark_image_done(&series_key(), "c1", 1).unwrap();

    let report = run(&site, dir.path(), "1");
    assert_eq!(site.fetched(), vec![FakeSite::image_url("c1", 2)]);
    assert_eq!(
        outcome_of(&report, "c1"),
        &ChapterOutcome::Done {
            resumed_from_checkpoint: true
        }
    );
    assert!(store.is_chapter_complete(&series_key(), "c1"));
    assert!(report.series_dir.join("Chapter 001").join("003.png").exists());
}

#[test]
fn selection_picks_inclusive_range_and_reports_misses() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(5, 1));

    let report = run(&site, dir.path(), "2-4");
    let numbers: Vec<String> = report
        .results
        .iter()
        .map(|r| r.chapter.display_number.to_string())
        .collect();
    assert_eq!(numbers, ["2", "3", "4"]);
    assert!(report.not_found.is_empty());

    site.reset_counters();
    let report = run(&site, dir.path(), "7");
    assert!(report.results.is_empty());
    assert_eq!(report.not_found, ["7"]);
    assert_eq!(site.network_calls(), 0);
}

#[test]
fn failed_page_is_isolated_and_retried_on_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(3, 3));
    site.fail_image("c2", 1);

    let report = run(&site, dir.path(), "");
    assert_eq!(
        outcome_of(&report, "c2"),
        &ChapterOutcome::PartiallyFailed { missing: vec![1] }
    );
    assert!(outcome_of(&report, "c1").is_done());
    assert!(outcome_of(&report, "c3").is_done());

    let chapter_dir = report.series_dir.join("Chapter 002");
    assert!(chapter_dir.join("001.png").exists());
    assert!(!chapter_dir.join("002.png").exists());
    assert!(chapter_dir.join("003.png").exists());

    site.heal();
    site.reset_counters();
    let report = run(&site, dir.path(), "");
    assert!(report.all_done());
    assert_eq!(site.fetched(), vec![FakeSite::image_url("c2", 1)]);
    assert!(chapter_dir.join("002.png").exists());
}

#[test]
fn stray_temp_file_leaves_checkpoint_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(1, 3));
    site.fail_image("c1", 2);
    run(&site, dir.path(), "");

    // simulate a crash in the middle of a checkpoint write
    let store = CheckpointStore::new(dir.path());
    let checkpoint_dir = store.dir_for(&series_key());
    std::fs::write(checkpoint_dir.join(".tmp-crash"), b"{\"chapter_id\":\"c1\",\"compl").unwrap();

    let record = store.load(&series_key()).unwrap();
    let c1 = &record.chapters["c1"];
    assert_eq!(c1.completed_images.iter().copied().collect::<Vec<_>>(), [0, 1]);
    assert_eq!(c1.total_images, Some(3));

    site.heal();
    site.reset_counters();
    let report = run(&site, dir.path(), "");
    assert!(report.all_done());
    assert_eq!(site.fetched(), vec![FakeSite::image_url("c1", 2)]);
}

#[test]
fn running_chapters_never_exceed_thread_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut site = FakeSite::new(6, 2);
    site.latency = Duration::from_millis(15);
    let site = Arc::new(site);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let reporter = CallbackReporter(move |event: &ProgressEvent| match event.kind {
        ProgressKind::Started => {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
        }
        ProgressKind::ChapterDone | ProgressKind::Failed { .. } | ProgressKind::Cancelled { .. } => {
            r.fetch_sub(1, Ordering::SeqCst);
        }
        _ => {}
    });

    let ctx = context(&site, config(2, 0.0), Arc::new(reporter));
    let report = download_series(&ctx, &request(dir.path(), "")).unwrap();

    assert!(report.all_done());
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[test]
fn chapter_starts_are_spaced_and_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(4, 1));
    let (tx, rx) = crossbeam_channel::unbounded();

    let ctx = context(
        &site,
        config(3, 0.1),
        Arc::new(ChannelReporter::new(tx)),
    );
    let report = download_series(&ctx, &request(dir.path(), "")).unwrap();
    drop(ctx);
    assert!(report.all_done());

    let mut starts: Vec<ProgressEvent> = rx
        .iter()
        .filter(|e| e.kind == ProgressKind::Started)
        .collect();
    starts.sort_by_key(|e| e.at);

    let ids: Vec<&str> = starts.iter().map(|e| e.chapter_id.as_str()).collect();
    assert_eq!(ids, ["c1", "c2", "c3", "c4"]);
    for pair in starts.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(100));
    }
}

#[test]
fn unreachable_series_is_the_only_fatal_error() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(1, 1));
    let ctx = context(&site, config(1, 0.0), Arc::new(NullReporter));

    let mut req = request(dir.path(), "");
    req.series_url = "https://fake.test/series/missing/x".to_string();
    assert!(matches!(
        download_series(&ctx, &req),
        Err(PipelineError::Catalog(_))
    ));
}

#[test]
fn panicking_chapter_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut site = FakeSite::new(3, 1);
    site.panicking_chapter = Some("c2".to_string());
    let site = Arc::new(site);

    let report = run(&site, dir.path(), "");
    assert!(matches!(outcome_of(&report, "c2"), ChapterOutcome::Failed { .. }));
    assert!(outcome_of(&report, "c1").is_done());
    assert!(outcome_of(&report, "c3").is_done());
}

#[test]
fn stop_request_cancels_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(3, 2));
    let ctx = context(&site, config(2, 0.0), Arc::new(NullReporter));
    ctx.cancel.store(true, Ordering::SeqCst);

    let report = download_series(&ctx, &request(dir.path(), "")).unwrap();
    assert_eq!(report.cancelled().len(), 3);
    assert!(site.fetched().is_empty());
}

#[test]
fn stop_mid_chapter_keeps_written_pages_and_resumes_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = Arc::new(AtomicBool::new(false));
    let fetched = Arc::new(AtomicUsize::new(0));
    let mut site = FakeSite::new(1, 5);
    let (flag, count) = (cancel.clone(), fetched.clone());
    site.after_fetch = Some(Box::new(move |_: &str| {
        if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            flag.store(true, Ordering::SeqCst);
        }
    }));
    let site = Arc::new(site);

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut ctx = context(&site, config(1, 0.0), Arc::new(ChannelReporter::new(tx)));
    ctx.cancel = cancel;
    let report = download_series(&ctx, &request(dir.path(), "")).unwrap();
    drop(ctx);

    assert_eq!(
        outcome_of(&report, "c1"),
        &ChapterOutcome::Cancelled {
            missing: vec![2, 3, 4]
        }
    );
    let kinds: Vec<ProgressKind> = rx.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ProgressKind::Cancelled { missing: 3 }));
    assert!(!kinds.iter().any(|k| matches!(k, ProgressKind::Failed { .. })));

    let chapter_dir = report.series_dir.join("Chapter 001");
    let mut names: Vec<String> = std::fs::read_dir(&chapter_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["001.png", "002.png"]);

    let site = Arc::new(FakeSite::new(1, 5));
    let report = run(&site, dir.path(), "");
    assert!(report.all_done());
    assert_eq!(
        site.fetched(),
        (2..5).map(|i| FakeSite::image_url("c1", i)).collect::<Vec<_>>()
    );
}

#[test]
fn retries_are_reported_as_progress() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(FakeSite::new(1, 2));
    site.flaky
        .lock()
        .unwrap()
        .insert(FakeSite::image_url("c1", 1));

    let (tx, rx) = crossbeam_channel::unbounded();
    let ctx = context(&site, config(1, 0.0), Arc::new(ChannelReporter::new(tx)));
    let report = download_series(&ctx, &request(dir.path(), "")).unwrap();
    drop(ctx);

    assert!(report.all_done());
    let retries: Vec<ProgressEvent> = rx
        .iter()
        .filter(|e| matches!(e.kind, ProgressKind::Retrying { .. }))
        .collect();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].chapter_id, "c1");
    assert_eq!(retries[0].kind, ProgressKind::Retrying { attempt: 2 });
    assert!(retries[0].detail.contains("502"));
}

#[test]
fn checkpoint_lost_mid_chapter_leaves_it_partially_failed() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_dir = CheckpointStore::new(dir.path()).dir_for(&series_key());
    let last_page = FakeSite::image_url("c1", 1);
    let mut site = FakeSite::new(1, 2);
    site.after_fetch = Some(Box::new(move |url: &str| {
        if url == last_page {
            std::fs::remove_dir_all(&checkpoint_dir).unwrap();
        }
    }));
    let site = Arc::new(site);

    let report = run(&site, dir.path(), "");
    assert_eq!(
        outcome_of(&report, "c1"),
        &ChapterOutcome::PartiallyFailed { missing: vec![0] }
    );
    assert!(!CheckpointStore::new(dir.path()).is_chapter_complete(&series_key(), "c1"));

    let site = Arc::new(FakeSite::new(1, 2));
    let report = run(&site, dir.path(), "");
    assert!(report.all_done());
    assert_eq!(site.fetched(), vec![FakeSite::image_url("c1", 0)]);
}

#[test]
fn checkpoints_live_under_the_requested_output_root() {
    let dir = tempfile::tempdir().unwrap();
    let (first_root, second_root) = (dir.path().join("a"), dir.path().join("b"));
    let site = Arc::new(FakeSite::new(1, 1));

    assert!(run(&site, &first_root, "").all_done());
    assert!(CheckpointStore::new(&first_root).is_chapter_complete(&series_key(), "c1"));
    assert!(!CheckpointStore::new(&second_root).is_chapter_complete(&series_key(), "c1"));

    site.reset_counters();
    assert!(run(&site, &second_root, "").all_done());
    assert_eq!(site.fetched().len(), 1);
    assert!(CheckpointStore::new(&second_root).is_chapter_complete(&series_key(), "c1"));
}
