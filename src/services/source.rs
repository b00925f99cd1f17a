//! The site session: login, search, and scraping of the pages the pipeline needs.
//!
//! `NovelSource` is the seam between the download pipeline and page markup. The
//! pipeline only sees URLs and metadata; all selectors live in `Wenku8Source`.

use crate::config::Config;
use crate::models::BookMetadata;
use crate::services::fetcher::BROWSER_USER_AGENT;
use crate::utils::{decode_page, gbk_query_component, sanitize_title};
use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A novel's detail page after search and navigation.
#[derive(Debug, Clone)]
pub struct BookPage {
    pub url: String,
    pub novel_id: String,
    pub html: String,
}

/// A downloadable asset and the page it should appear to come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLocation {
    pub url: String,
    pub referer: Option<String>,
}

#[allow(async_fn_in_trait)]
pub trait NovelSource {
    /// Client carrying the session cookies; resource downloads reuse it.
    fn http_client(&self) -> reqwest::Client;

    async fn login(&self, credentials: &Credentials) -> bool;

    /// Searches for `title` and opens its detail page.
    async fn open_book(&self, title: &str) -> Option<BookPage>;

    fn metadata(&self, page: &BookPage) -> BookMetadata;

    /// Illustration page per volume, in index order. Volume names are file-system safe.
    async fn illustration_links(&self, page: &BookPage) -> Vec<(String, String)>;

    async fn illustration_images(&self, url: &str) -> Vec<String>;

    /// Alternate endpoints for the full text, to be tried in order.
    fn text_locations(&self, page: &BookPage) -> Vec<AssetLocation>;
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("bad selector {}: {:?}", css, e))
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn absolute(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(String::from)
}

/// "/book/1234.htm" -> "1234".
pub fn novel_id_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let segments: Vec<&str> = url.path().trim_matches('/').split('/').collect();
    let id = segments.get(1)?.trim_end_matches(".htm");
    if id.is_empty() { None } else { Some(id.to_string()) }
}

pub fn parse_metadata(html: &str, page_url: &str) -> Result<BookMetadata> {
    let document = Html::parse_document(html);
    let mut metadata = BookMetadata::default();

    let td = selector("td")?;
    match document
        .select(&td)
        .map(element_text)
        .find(|text| text.contains("小说作者："))
    {
        Some(text) => metadata.author = text.replace("小说作者：", "").trim().to_string(),
        None => tracing::warn!("author not found on {}", page_url),
    }

    let span = selector("span")?;
    let synopsis = document
        .select(&span)
        .find(|el| element_text(*el).contains("内容简介："))
        .and_then(|label| {
            label
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|sibling| sibling.value().name() == "span")
        })
        .map(element_text);
    match synopsis {
        Some(text) => metadata.synopsis = text,
        None => tracing::warn!("synopsis not found on {}", page_url),
    }

    let cover = selector(r#"td[width="20%"] img"#)?;
    metadata.cover_url = document
        .select(&cover)
        .filter_map(|img| img.value().attr("src"))
        .find(|src| !src.trim().is_empty())
        .and_then(|src| absolute(page_url, src.trim()));
    if metadata.cover_url.is_none() {
        tracing::warn!("cover image not found on {}", page_url);
    }

    Ok(metadata)
}

/// First link to a book detail page in a search result listing.
pub fn parse_search_result(html: &str, page_url: &str) -> Result<Option<String>> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    Ok(document
        .select(&links)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| absolute(page_url, href))
        .find(|url| novel_id_from_url(url).is_some() && url.contains("/book/")))
}

pub fn parse_index_link(html: &str, page_url: &str) -> Result<Option<String>> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    Ok(document
        .select(&links)
        .find(|a| element_text(*a).contains("小说目录"))
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| absolute(page_url, href)))
}

/// Walks the index table: a `vcss` cell starts a volume, and a later row's link
/// mentioning 插图 is that volume's illustration page.
pub fn parse_illustration_links(html: &str, page_url: &str) -> Result<Vec<(String, String)>> {
    let document = Html::parse_document(html);
    let rows = selector("tr")?;
    let header = selector(".vcss")?;
    let links = selector("a[href]")?;

    let mut found: Vec<(String, String)> = Vec::new();
    let mut current = String::new();

    for row in document.select(&rows) {
        if let Some(cell) = row.select(&header).next() {
            current = sanitize_title(&element_text(cell));
            continue;
        }
        if current.is_empty() {
            continue;
        }
        let link = row
            .select(&links)
            .find(|a| element_text(*a).contains("插图"))
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| absolute(page_url, href));
        if let Some(url) = link {
            match found.iter_mut().find(|(volume, _)| *volume == current) {
                Some(entry) => entry.1 = url,
                None => found.push((current.clone(), url)),
            }
        }
    }

    Ok(found)
}

pub fn parse_illustration_images(html: &str, page_url: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let images = selector("img.imagecontent")?;
    Ok(document
        .select(&images)
        .filter_map(|img| img.value().attr("src"))
        .filter(|src| !src.trim().is_empty())
        .filter_map(|src| absolute(page_url, src.trim()))
        .collect())
}

pub struct Wenku8Source {
    client: reqwest::Client,
    base_url: String,
    download_base_url: String,
}

impl Wenku8Source {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(BROWSER_USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            download_base_url: config.download_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetches a page and returns its final URL (after redirects) and decoded body.
    async fn get_page(&self, url: &str) -> Result<(String, String)> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let final_url = response.url().to_string();
        let body = response.bytes().await?;
        Ok((final_url, decode_page(&body)))
    }

    async fn try_open_book(&self, title: &str) -> Result<Option<BookPage>> {
        let search = format!(
            "{}/modules/article/search.php?searchtype=articlename&searchkey={}",
            self.base_url,
            gbk_query_component(title)
        );
        let (url, html) = self.get_page(&search).await?;

        // A unique hit redirects straight to the detail page.
        let (url, html) = match novel_id_from_url(&url).filter(|_| url.contains("/book/")) {
            Some(_) => (url, html),
            None => match parse_search_result(&html, &url)? {
                Some(book_url) => self.get_page(&book_url).await?,
                None => return Ok(None),
            },
        };

        let novel_id = novel_id_from_url(&url)
            .with_context(|| format!("cannot extract novel id from {}", url))?;
        Ok(Some(BookPage {
            url,
            novel_id,
            html,
        }))
    }

    async fn try_illustration_links(&self, page: &BookPage) -> Result<Vec<(String, String)>> {
        let Some(index_url) = parse_index_link(&page.html, &page.url)? else {
            tracing::warn!("no index link on {}", page.url);
            return Ok(Vec::new());
        };
        let (url, html) = self.get_page(&index_url).await?;
        parse_illustration_links(&html, &url)
    }
}

impl NovelSource for Wenku8Source {
    fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    async fn login(&self, credentials: &Credentials) -> bool {
        let url = format!("{}/login.php?do=submit", self.base_url);
        let form = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("usecookie", "315360000"),
            ("action", "login"),
        ];

        let result = async {
            let response = self.client.post(&url).form(&form).send().await?;
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(decode_page(&body))
        }
        .await;

        match result {
            Ok(html) if html.contains("欢迎您") || html.contains("登录成功") => {
                tracing::info!("logged in as {}", credentials.username);
                true
            }
            Ok(_) => {
                tracing::error!("login rejected for {}", credentials.username);
                false
            }
            Err(e) => {
                tracing::error!("login request failed: {}", e);
                false
            }
        }
    }

    async fn open_book(&self, title: &str) -> Option<BookPage> {
        match self.try_open_book(title).await {
            Ok(Some(page)) => Some(page),
            Ok(None) => {
                tracing::warn!("search found no book titled {}", title);
                None
            }
            Err(e) => {
                tracing::warn!("search for {} failed: {:#}", title, e);
                None
            }
        }
    }

    fn metadata(&self, page: &BookPage) -> BookMetadata {
        parse_metadata(&page.html, &page.url).unwrap_or_else(|e| {
            tracing::warn!("metadata scrape failed: {:#}", e);
            BookMetadata::default()
        })
    }

    async fn illustration_links(&self, page: &BookPage) -> Vec<(String, String)> {
        self.try_illustration_links(page).await.unwrap_or_else(|e| {
            tracing::warn!("illustration index unavailable: {:#}", e);
            Vec::new()
        })
    }

    async fn illustration_images(&self, url: &str) -> Vec<String> {
        let result = async {
            let (final_url, html) = self.get_page(url).await?;
            parse_illustration_images(&html, &final_url)
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::warn!("illustration page {} unavailable: {:#}", url, e);
            Vec::new()
        })
    }

    fn text_locations(&self, page: &BookPage) -> Vec<AssetLocation> {
        let referer = format!(
            "{}/modules/article/packshow.php?id={}&type=txtfull",
            self.base_url, page.novel_id
        );
        [1, 2]
            .into_iter()
            .map(|node| AssetLocation {
                url: format!(
                    "{}/down.php?type=txt&node={}&id={}",
                    self.download_base_url, node, page.novel_id
                ),
                referer: Some(referer.clone()),
            })
            .collect()
    }
}
