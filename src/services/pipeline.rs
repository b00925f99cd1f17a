//! Per-collection orchestration: validate cached illustrations, download what is
//! missing, then segment the text and hand the assembled document to the sink.
//!
//! Collections run one after another. The illustration stage is the only fan-out.

use crate::config::Config;
use crate::models::{Book, IllustrationSet, Resource};
use crate::services::assembler::{DocumentSink, assemble};
use crate::services::coordinator::{FetchCoordinator, FetchTask};
use crate::services::fetcher::{Fetch, FetchRequest, ResourceFetcher};
use crate::services::hasher::fingerprint_file;
use crate::services::ledger::{LEDGER_FILE, Ledger, Validation};
use crate::services::segmenter::{Segmenter, SegmenterRules};
use crate::services::source::{BookPage, NovelSource};
use crate::utils::{decode_text, sanitize_title};
use anyhow::{Context, Result, bail};
use rand::Rng;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const COVER_FILE: &str = "cover.jpg";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub built: usize,
    pub failed: usize,
}

/// File name for the `index`-th image of a volume: the URL's last path segment,
/// or a two-digit sequence number.
pub fn image_file_name(url: &str, index: usize) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|name| sanitize_title(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{:02}.jpg", index + 1))
}

pub struct CollectionPipeline<'a, S> {
    source: &'a S,
    sink: &'a dyn DocumentSink,
    fetcher: Arc<ResourceFetcher>,
    coordinator: FetchCoordinator<ResourceFetcher>,
    segmenter: Segmenter,
    config: &'a Config,
}

impl<'a, S: NovelSource> CollectionPipeline<'a, S> {
    pub fn new(source: &'a S, sink: &'a dyn DocumentSink, config: &'a Config) -> Result<Self> {
        let fetcher = Arc::new(ResourceFetcher::new(
            source.http_client(),
            config.request_timeout(),
        ));
        let coordinator = FetchCoordinator::new(Arc::clone(&fetcher), config.max_workers);
        let segmenter = Segmenter::new(SegmenterRules::default())?;

        Ok(Self {
            source,
            sink,
            fetcher,
            coordinator,
            segmenter,
            config,
        })
    }

    /// Processes one collection end to end and returns the path of the written document.
    pub async fn process(&self, title: &str) -> Result<PathBuf> {
        tracing::info!("processing 《{}》", title);

        let safe_title = sanitize_title(title);
        let workdir = self.config.download_root.join(&safe_title);
        std::fs::create_dir_all(&workdir)
            .with_context(|| format!("Failed to create {}", workdir.display()))?;

        let ledger_path = workdir.join(LEDGER_FILE);
        let cached = match Ledger::load(&ledger_path).map(|ledger| ledger.validate(&workdir)) {
            Some(Validation::Valid(set)) => Some(set),
            Some(Validation::Invalid(reason)) => {
                tracing::info!("cached illustrations rejected: {}", reason);
                None
            }
            None => None,
        };

        let page = self
            .source
            .open_book(title)
            .await
            .with_context(|| format!("《{}》 not found", title))?;

        let metadata = self.source.metadata(&page);
        let cover = self.fetch_cover(metadata.cover_url.as_deref(), &workdir).await;

        let illustrations = match cached {
            Some(set) => {
                tracing::info!(
                    volumes = set.len(),
                    files = set.resource_count(),
                    "illustrations verified against ledger, skipping download"
                );
                set
            }
            None => self.download_illustrations(&page, &workdir, &ledger_path).await,
        };

        let text_path = self.ensure_text(&page, &workdir, &safe_title).await?;
        let bytes = std::fs::read(&text_path)
            .with_context(|| format!("Failed to read {}", text_path.display()))?;
        let text = decode_text(&bytes);

        let segmented = self.segmenter.segment(&text, illustrations)?;
        let book = Book {
            title: title.to_string(),
            language: self.config.language.clone(),
            metadata,
            cover,
            text: segmented,
        };

        let document = assemble(&book);
        let dest = workdir.join(format!("{}.epub", safe_title));
        self.sink.write(&document, &dest)?;
        Ok(dest)
    }

    async fn fetch_cover(&self, cover_url: Option<&str>, workdir: &Path) -> Option<Resource> {
        let Some(url) = cover_url else {
            tracing::info!("no cover URL, skipping cover");
            return None;
        };

        let dest = workdir.join(COVER_FILE);
        if dest.is_file() {
            if let Some(fingerprint) = fingerprint_file(&dest) {
                tracing::info!("reusing local cover {}", dest.display());
                return Some(Resource {
                    name: COVER_FILE.to_string(),
                    path: dest,
                    fingerprint,
                });
            }
        }

        let request = FetchRequest::new(url, dest).timeout(self.config.request_timeout());
        match self.fetcher.fetch(request).await {
            Ok(resource) => Some(resource),
            Err(e) => {
                tracing::warn!("cover skipped: {}", e);
                None
            }
        }
    }

    async fn pause(&self) {
        let (min, max) = self.config.page_delay();
        if max == 0 {
            return;
        }
        let delay = rand::thread_rng().gen_range(min..=max);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    async fn download_illustrations(
        &self,
        page: &BookPage,
        workdir: &Path,
        ledger_path: &Path,
    ) -> IllustrationSet {
        let links = self.source.illustration_links(page).await;
        if links.is_empty() {
            tracing::info!("no illustration links found");
            return IllustrationSet::new();
        }

        let mut tasks = Vec::new();
        for (i, (volume, url)) in links.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            let images = self.source.illustration_images(url).await;
            tracing::debug!("{} lists {} images", volume, images.len());

            let volume_dir = workdir.join(volume);
            for (j, src) in images.iter().enumerate() {
                let dest = volume_dir.join(image_file_name(src, j));
                tasks.push(FetchTask {
                    request: FetchRequest::new(src, dest).referer(url),
                    context: volume.clone(),
                });
            }
        }

        if tasks.is_empty() {
            return IllustrationSet::new();
        }

        tracing::info!(
            tasks = tasks.len(),
            workers = self.coordinator.workers(),
            "downloading illustrations"
        );
        let report = self.coordinator.run(tasks).await;
        if !report.any_succeeded() {
            tracing::warn!("no illustration could be downloaded");
            return IllustrationSet::new();
        }
        let complete = report.failed() == 0;

        let mut grouped: Vec<(String, Vec<Resource>)> = Vec::new();
        for outcome in report.outcomes {
            let resource = match outcome.result {
                Ok(resource) => resource,
                Err(e) => {
                    tracing::warn!(volume = %outcome.context, "illustration missing: {}", e);
                    continue;
                }
            };
            let continues_volume = grouped
                .last()
                .is_some_and(|(volume, _)| *volume == outcome.context);
            if continues_volume {
                if let Some((_, resources)) = grouped.last_mut() {
                    resources.push(resource);
                }
            } else {
                grouped.push((outcome.context, vec![resource]));
            }
        }

        let mut set = IllustrationSet::new();
        for (volume, resources) in grouped {
            set.insert(volume, resources);
        }

        if complete {
            if let Err(e) = Ledger::save(ledger_path, &set) {
                tracing::warn!("ledger not written: {:#}", e);
            }
        } else {
            tracing::warn!("some illustrations failed, ledger left unwritten so the next run retries");
        }

        set
    }

    async fn ensure_text(&self, page: &BookPage, workdir: &Path, safe_title: &str) -> Result<PathBuf> {
        let path = workdir.join(format!("{}.txt", safe_title));
        let min = self.config.min_text_bytes;

        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() > min as u64 {
                tracing::info!("reusing local text {}", path.display());
                return Ok(path);
            }
        }

        for location in self.source.text_locations(page) {
            let mut request = FetchRequest::new(&location.url, &path)
                .min_bytes(min)
                .timeout(self.config.text_timeout());
            if let Some(referer) = &location.referer {
                request = request.referer(referer);
            }

            match self.fetcher.fetch(request).await {
                Ok(_) => {
                    tracing::info!("text saved from {}", location.url);
                    return Ok(path);
                }
                Err(e) => tracing::warn!("text endpoint failed, trying next: {}", e),
            }
        }

        bail!("text for {} could not be downloaded", safe_title)
    }
}

/// Logs in once and processes every title; a failed title never stops the batch.
pub async fn run_batch<S: NovelSource>(
    source: &S,
    sink: &dyn DocumentSink,
    config: &Config,
    titles: &[String],
) -> Result<BatchSummary> {
    if !source.login(&config.credentials()).await {
        bail!("login failed, nothing processed");
    }

    let pipeline = CollectionPipeline::new(source, sink, config)?;
    let mut summary = BatchSummary::default();

    for title in titles {
        match pipeline.process(title).await {
            Ok(path) => {
                tracing::info!("《{}》 done: {}", title, path.display());
                summary.built += 1;
            }
            Err(e) => {
                tracing::error!("《{}》 failed: {:#}", title, e);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookMetadata;
    use crate::services::epub::EpubSink;
    use crate::services::source::{AssetLocation, Credentials};
    use crate::test_support::serve;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::fs::File;
use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const NOVEL: &str = "简介之前的话\n第一卷 :开端\n插图\n序章\n序章正文\n第一章 相遇\n正文甲\n正文乙\n短篇\n短篇正文";

    #[derive(Default)]
    struct Hits {
        cover: AtomicUsize,
        images: AtomicUsize,
        text: AtomicUsize,
    }

    struct FakeSource {
        base: String,
        text_ok: bool,
        broken_image: bool,
    }

    impl FakeSource {
        fn new(base: impl Into<String>, text_ok: bool) -> Self {
            Self {
                base: base.into(),
                text_ok,
                broken_image: false,
            }
        }
    }

    impl NovelSource for FakeSource {
        fn http_client(&self) -> reqwest::Client {
            reqwest::Client::new()
        }

        async fn login(&self, credentials: &Credentials) -> bool {
            credentials.username == "reader"
        }

        async fn open_book(&self, title: &str) -> Option<BookPage> {
            (title != "不存在").then(|| BookPage {
                url: format!("{}/book/7.htm", self.base),
                novel_id: "7".into(),
                html: String::new(),
            })
        }

        fn metadata(&self, _page: &BookPage) -> BookMetadata {
            BookMetadata {
                author: "作者".into(),
                synopsis: "简介".into(),
                cover_url: Some(format!("{}/cover.jpg", self.base)),
            }
        }

        async fn illustration_links(&self, _page: &BookPage) -> Vec<(String, String)> {
            vec![("第一卷 开端".into(), format!("{}/illust/1.htm", self.base))]
        }

        async fn illustration_images(&self, _url: &str) -> Vec<String> {
            let second = if self.broken_image { "404.jpg" } else { "102.jpg" };
            vec![
                format!("{}/pics/101.jpg", self.base),
                format!("{}/pics/{}", self.base, second),
            ]
        }

        fn text_locations(&self, _page: &BookPage) -> Vec<AssetLocation> {
            let good = if self.text_ok { "full.txt" } else { "tiny.txt" };
            vec![
                AssetLocation {
                    url: format!("{}/tiny.txt", self.base),
                    referer: None,
                },
                AssetLocation {
                    url: format!("{}/{}", self.base, good),
                    referer: Some(format!("{}/packshow", self.base)),
                },
            ]
        }
    }

    async fn site(hits: Arc<Hits>) -> String {
        let cover_hits = Arc::clone(&hits);
        let image_hits = Arc::clone(&hits);
        let text_hits = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/cover.jpg",
                get(move || {
                    let hits = Arc::clone(&cover_hits);
                    async move {
                        hits.cover.fetch_add(1, Ordering::SeqCst);
                        vec![9u8; 64]
                    }
                }),
            )
            .route(
                "/pics/:name",
                get(move |axum::extract::Path(name): axum::extract::Path<String>| {
                    let hits = Arc::clone(&image_hits);
                    async move {
                        hits.images.fetch_add(1, Ordering::SeqCst);
                        if name == "404.jpg" {
                            return Err(StatusCode::NOT_FOUND);
                        }
                        Ok(name.into_bytes())
                    }
                }),
            )
            .route("/tiny.txt", get(|| async { "404" }))
            .route(
                "/full.txt",
                get(move || {
                    let hits = Arc::clone(&text_hits);
                    async move {
                        hits.text.fetch_add(1, Ordering::SeqCst);
                        NOVEL
                    }
                }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        serve(app).await
    }

    fn config(root: &Path) -> Config {
        Config {
            username: "reader".into(),
            download_root: root.to_path_buf(),
            page_delay_ms: [0, 0],
            max_workers: 4,
            ..Config::default()
        }
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    fn zip_entry(path: &Path, suffix: &str) -> String {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let name = archive
            .file_names()
            .find(|n| n.ends_with(suffix))
            .map(str::to_string)
            .unwrap();
        let mut out = String::new();
        archive.by_name(&name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn image_names_come_from_the_url() {
        assert_eq!(image_file_name("https://pic.example/a/b/101.jpg", 0), "101.jpg");
        assert_eq!(image_file_name("https://pic.example/", 4), "05.jpg");
        assert_eq!(image_file_name("not a url", 0), "01.jpg");
    }

    #[tokio::test]
    async fn first_run_downloads_and_second_run_reuses() {
        let hits = Arc::new(Hits::default());
        let base = site(Arc::clone(&hits)).await;
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let source = FakeSource::new(base, true);

        let summary = run_batch(&source, &EpubSink, &config, &["测试/书".to_string()])
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary { built: 1, failed: 0 });

        let workdir = root.path().join("测试书");
        let epub = workdir.join("测试书.epub");
        assert!(epub.exists());
        assert!(workdir.join("cover.jpg").exists());
        assert!(workdir.join("测试书.txt").exists());
        assert_eq!(
            std::fs::read(workdir.join("第一卷 开端").join("101.jpg")).unwrap(),
            b"101.jpg"
        );
        assert_eq!(hits.images.load(Ordering::SeqCst), 2);
        assert_eq!(hits.text.load(Ordering::SeqCst), 1);

        let ledger = Ledger::load(&workdir.join(LEDGER_FILE)).expect("ledger written");
        assert_eq!(ledger.file_count(), 2);

        let names = zip_names(&epub);
        assert!(names.iter().any(|n| n.ends_with("illust_1.xhtml")));
        assert!(names.iter().any(|n| n.ends_with("images/第一卷 开端/102.jpg")));
        assert!(names.iter().any(|n| n.ends_with("vol_1_chap_2.xhtml")));

        // Everything verified on disk: no further cover, image or text downloads.
        let pipeline = CollectionPipeline::new(&source, &EpubSink, &config).unwrap();
        pipeline.process("测试/书").await.unwrap();
        assert_eq!(hits.cover.load(Ordering::SeqCst), 1);
        assert_eq!(hits.images.load(Ordering::SeqCst), 2);
        assert_eq!(hits.text.load(Ordering::SeqCst), 1);

        // A modified illustration forces a full re-download.
        std::fs::write(workdir.join("第一卷 开端").join("101.jpg"), b"tampered").unwrap();
        pipeline.process("测试/书").await.unwrap();
        assert_eq!(hits.images.load(Ordering::SeqCst), 4);
        assert_eq!(
            std::fs::read(workdir.join("第一卷 开端").join("101.jpg")).unwrap(),
            b"101.jpg"
        );
    }

    #[tokio::test]
    async fn partial_illustrations_build_the_book_but_skip_the_ledger() {
        let hits = Arc::new(Hits::default());
        let base = site(Arc::clone(&hits)).await;
        let root = TempDir::new().unwrap();
        let config = config(root.path());
        let source = FakeSource {
            broken_image: true,
            ..FakeSource::new(base, true)
        };
        let pipeline = CollectionPipeline::new(&source, &EpubSink, &config).unwrap();

        let epub = pipeline.process("残缺").await.unwrap();
        assert!(epub.exists());
        assert_eq!(hits.images.load(Ordering::SeqCst), 2);

        let workdir = root.path().join("残缺");
        assert!(!workdir.join(LEDGER_FILE).exists());
        assert!(workdir.join("第一卷 开端").join("101.jpg").exists());
        assert!(!workdir.join("第一卷 开端").join("404.jpg").exists());

        let page = zip_entry(&epub, "illust_1.xhtml");
        assert!(page.contains("101.jpg"));
        assert!(!page.contains("404.jpg"));

        // Without a ledger the next run fetches every illustration again.
        pipeline.process("残缺").await.unwrap();
        assert_eq!(hits.images.load(Ordering::SeqCst), 4);
        assert!(!workdir.join(LEDGER_FILE).exists());
    }

    #[tokio::test]
    async fn failed_collections_do_not_stop_the_batch() {
        let base = site(Arc::new(Hits::default())).await;
        let root = TempDir::new().unwrap();
        let config = config(root.path());

        let broken = FakeSource::new(base.clone(), false);
        let summary = run_batch(
            &broken,
            &EpubSink,
            &config,
            &["不存在".to_string(), "无正文".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(summary, BatchSummary { built: 0, failed: 2 });
        assert!(!root.path().join("无正文").join("无正文.epub").exists());
        assert!(!root.path().join("无正文").join("无正文.txt").exists());

        let working = FakeSource::new(base, true);
        let summary = run_batch(&working, &EpubSink, &config, &["无正文".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.built, 1);
    }

    #[tokio::test]
    async fn login_failure_aborts_before_any_collection() {
        let root = TempDir::new().unwrap();
        let mut config = config(root.path());
        config.username = "stranger".into();
        let source = FakeSource::new("http://127.0.0.1:1", true);

        assert!(run_batch(&source, &EpubSink, &config, &["书".to_string()]).await.is_err());
        assert!(!root.path().join("书").exists());
    }
}
