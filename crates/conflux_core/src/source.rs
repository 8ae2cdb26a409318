use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SourceSettings;
use crate::model::{AttachmentDocument, ContentDocument, ContentKind, SpaceDocument};
use crate::store::{AttachmentOutcome, GcReport, Store};

/// Expansions requested for every page and blog post.
pub const CONTENT_EXPANDS: &str = "version,metadata.labels,history,children.page,body.export_view,children.attachment,children.attachment.version,children.attachment.history";
pub const BLOG_PAGE_SIZE: usize = 50;
pub const ROOT_LEVEL: i64 = 0;

/// Deferred access to attachment bytes. Nothing is transferred until `open` is called.
pub trait ByteSource {
    fn open(&self) -> Result<Box<dyn Read>>;
}

/// One page of blog-post search results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub size: Option<usize>,
}

impl SearchPage {
    pub fn returned(&self) -> usize {
        self.size.unwrap_or(self.results.len())
    }
}

/// Read access to the content source.
///
/// `Ok(None)` means the server answered with a non-success status; callers
/// skip whatever they asked for. `Err` is reserved for transport and decoding
/// failures.
pub trait ContentApi {
    fn homepage_id(&mut self) -> Result<Option<String>>;
    fn get_content(&mut self, id: &str) -> Result<Option<Value>>;
    fn search_blog_posts(&mut self, start: usize, limit: usize) -> Result<Option<SearchPage>>;
    fn attachment_stream(&self, download_link: &str) -> Box<dyn ByteSource>;
    fn request_count(&self) -> usize;
}

#[derive(Debug)]
pub struct FetchedContent {
    pub id: String,
    pub kind: ContentKind,
    pub title: String,
    pub level: Option<i64>,
    pub parent_id: Option<String>,
    pub labels: Vec<String>,
    pub payload: Value,
    pub attachments: Vec<FetchedAttachment>,
}

pub struct FetchedAttachment {
    pub id: String,
    pub title: String,
    pub parent_id: String,
    pub payload: Value,
    pub stream: Box<dyn ByteSource>,
}

impl fmt::Debug for FetchedAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedAttachment")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

impl FetchedContent {
    /// Build a fetched record from an expanded content payload.
    /// Returns the record together with the IDs of its child pages.
    pub fn from_payload<A>(
        api: &A,
        payload: Value,
        level: Option<i64>,
        parent_id: Option<String>,
    ) -> Result<(Self, Vec<String>)>
    where
        A: ContentApi + ?Sized,
    {
        let document = ContentDocument::from_payload(&payload)?;
        let kind = document.content_kind()?;

        if document
            .label_listing()
            .is_some_and(|listing| listing.possibly_truncated())
        {
            warn!(id = %document.id, title = %document.title, "probably more labels than returned");
        }

        let mut attachments = Vec::new();
        if let Some(listing) = document.attachment_listing() {
            if listing.possibly_truncated() {
                warn!(id = %document.id, title = %document.title, "probably more attachments than returned");
            }
            for attachment_payload in &listing.results {
                let attachment = AttachmentDocument::from_payload(attachment_payload)
                    .with_context(|| format!("invalid attachment listed on {}", document.id))?;
                attachments.push(FetchedAttachment {
                    stream: api.attachment_stream(&attachment.links.download),
                    id: attachment.id,
                    title: attachment.title,
                    parent_id: document.id.clone(),
                    payload: attachment_payload.clone(),
                });
            }
        }

        let children = document.child_page_ids();
        let labels = document.labels();
        Ok((
            Self {
                id: document.id,
                kind,
                title: document.title,
                level,
                parent_id,
                labels,
                payload,
                attachments,
            },
            children,
        ))
    }
}

struct PendingPage {
    id: String,
    level: i64,
    parent_id: Option<String>,
}

/// Lazy depth-first pre-order walk of the page tree rooted at the space homepage.
///
/// A page the server refuses is skipped along with its whole subtree. The
/// first hard error is yielded once and ends the walk.
pub struct PageWalk<'a, A: ContentApi + ?Sized> {
    api: &'a mut A,
    pending: Vec<PendingPage>,
    started: bool,
    finished: bool,
}

impl<'a, A: ContentApi + ?Sized> PageWalk<'a, A> {
    pub fn new(api: &'a mut A) -> Self {
        Self {
            api,
            pending: Vec::new(),
            started: false,
            finished: false,
        }
    }

    fn fail(&mut self, error: anyhow::Error) -> Option<Result<FetchedContent>> {
        self.finished = true;
        self.pending.clear();
        Some(Err(error))
    }
}

impl<A: ContentApi + ?Sized> Iterator for PageWalk<'_, A> {
    type Item = Result<FetchedContent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            match self.api.homepage_id() {
                Ok(Some(id)) => {
                    debug!(%id, "space homepage");
                    self.pending.push(PendingPage {
                        id,
                        level: ROOT_LEVEL,
                        parent_id: None,
                    });
                }
                Ok(None) => {
                    warn!("space homepage unavailable; no pages will be fetched");
                    self.finished = true;
                    return None;
                }
                Err(error) => return self.fail(error),
            }
        }

        while let Some(page) = self.pending.pop() {
            let payload = match self.api.get_content(&page.id) {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    warn!(id = %page.id, "page unavailable; skipping its subtree");
                    continue;
                }
                Err(error) => return self.fail(error),
            };
            let built = FetchedContent::from_payload(
                &*self.api,
                payload,
                Some(page.level),
                page.parent_id,
            )
            .with_context(|| format!("failed to read page {}", page.id));
            let (content, children) = match built {
                Ok(built) => built,
                Err(error) => return self.fail(error),
            };
            for child in children.into_iter().rev() {
                self.pending.push(PendingPage {
                    id: child,
                    level: page.level + 1,
                    parent_id: Some(content.id.clone()),
                });
            }
            return Some(Ok(content));
        }

        self.finished = true;
        None
    }
}

/// Lazy iterator over every blog post in the space, fetched `BLOG_PAGE_SIZE` at a time.
///
/// Only a short page or a refused request ends the listing; an exactly-full
/// page always triggers one more request.
pub struct BlogPager<'a, A: ContentApi + ?Sized> {
    api: &'a mut A,
    buffer: VecDeque<Value>,
    start: usize,
    exhausted: bool,
}

impl<'a, A: ContentApi + ?Sized> BlogPager<'a, A> {
    pub fn new(api: &'a mut A) -> Self {
        Self {
            api,
            buffer: VecDeque::new(),
            start: 0,
            exhausted: false,
        }
    }
}

impl<A: ContentApi + ?Sized> Iterator for BlogPager<'_, A> {
    type Item = Result<FetchedContent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(payload) = self.buffer.pop_front() {
                let built = FetchedContent::from_payload(&*self.api, payload, None, None)
                    .context("failed to read blog post");
                return Some(match built {
                    Ok((content, _)) => Ok(content),
                    Err(error) => {
                        self.exhausted = true;
                        self.buffer.clear();
                        Err(error)
                    }
                });
            }
            if self.exhausted {
                return None;
            }

            match self.api.search_blog_posts(self.start, BLOG_PAGE_SIZE) {
                Ok(Some(page)) => {
                    debug!(start = self.start, returned = page.returned(), "blog search page");
                    if page.returned() < BLOG_PAGE_SIZE || page.results.is_empty() {
                        self.exhausted = true;
                    }
                    self.start += BLOG_PAGE_SIZE;
                    self.buffer.extend(page.results);
                }
                Ok(None) => {
                    warn!(start = self.start, "blog search refused; stopping");
                    self.exhausted = true;
                }
                Err(error) => {
                    self.exhausted = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub pages: usize,
    pub blog_posts: usize,
    pub attachments_downloaded: usize,
    pub attachments_reused: usize,
    pub attachments_failed: usize,
    pub gc: GcReport,
    pub request_count: usize,
}

/// Walk pages then blog posts, store everything, and commit the run.
///
/// Any hard error aborts before `commit`, so nothing is garbage collected
/// on a partial run.
pub fn fetch_into_store<A>(api: &mut A, store: &mut Store) -> Result<FetchReport>
where
    A: ContentApi + ?Sized,
{
    let mut report = FetchReport::default();

    for content in PageWalk::new(api) {
        let content = content?;
        store_fetched(store, &content, &mut report)?;
        report.pages += 1;
    }
    for content in BlogPager::new(api) {
        let content = content?;
        store_fetched(store, &content, &mut report)?;
        report.blog_posts += 1;
    }

    report.gc = store.commit()?;
    report.request_count = api.request_count();
    info!(
        pages = report.pages,
        blog_posts = report.blog_posts,
        downloaded = report.attachments_downloaded,
        removed = report.gc.total(),
        "fetch complete"
    );
    Ok(report)
}

fn store_fetched(store: &mut Store, content: &FetchedContent, report: &mut FetchReport) -> Result<()> {
    store.store_content(content)?;
    for attachment in &content.attachments {
        match store.store_attachment(content, attachment) {
            Ok(AttachmentOutcome::Downloaded) => report.attachments_downloaded += 1,
            Ok(AttachmentOutcome::Reused) => report.attachments_reused += 1,
            Err(error) => {
                warn!(
                    id = %attachment.id,
                    title = %attachment.title,
                    "attachment not stored: {error:#}"
                );
                report.attachments_failed += 1;
            }
        }
    }
    Ok(())
}

pub struct ConfluenceClient {
    client: Client,
    settings: SourceSettings,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        Url::parse(&settings.url)
            .with_context(|| format!("invalid source URL: {}", settings.url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build content API HTTP client")?;
        Ok(Self {
            client,
            settings,
            request_count: 0,
        })
    }

    fn request_json(&mut self, path: &str, params: &[(&str, String)]) -> Result<Option<Value>> {
        self.request_count = self.request_count.saturating_add(1);
        let url = join_url(&self.settings.url, path);
        let response = self
            .client
            .get(url.as_str())
            .header("User-Agent", self.settings.user_agent.clone())
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .query(params)
            .send()
            .with_context(|| format!("failed to call {url}"))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, %url, "content API request not successful");
            return Ok(None);
        }
        let payload: Value = response
            .json()
            .with_context(|| format!("failed to decode JSON response from {url}"))?;
        Ok(Some(payload))
    }
}

impl ContentApi for ConfluenceClient {
    fn homepage_id(&mut self) -> Result<Option<String>> {
        let path = format!("rest/api/space/{}", self.settings.space);
        let Some(payload) = self.request_json(&path, &[("expand", "homepage".to_string())])? else {
            return Ok(None);
        };
        let space: SpaceDocument =
            serde_json::from_value(payload).context("space response has no homepage")?;
        Ok(Some(space.homepage.id))
    }

    fn get_content(&mut self, id: &str) -> Result<Option<Value>> {
        let path = format!("rest/api/content/{id}");
        self.request_json(&path, &[("expand", CONTENT_EXPANDS.to_string())])
    }

    fn search_blog_posts(&mut self, start: usize, limit: usize) -> Result<Option<SearchPage>> {
        let params = [
            (
                "cql",
                format!("space.key = {} AND type = blogpost", self.settings.space),
            ),
            ("expand", CONTENT_EXPANDS.to_string()),
            ("limit", limit.to_string()),
            ("start", start.to_string()),
        ];
        let Some(payload) = self.request_json("rest/api/content/search", &params)? else {
            return Ok(None);
        };
        let page: SearchPage =
            serde_json::from_value(payload).context("malformed blog search response")?;
        Ok(Some(page))
    }

    fn attachment_stream(&self, download_link: &str) -> Box<dyn ByteSource> {
        Box::new(HttpByteSource {
            client: self.client.clone(),
            url: join_url(&self.settings.url, download_link),
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            user_agent: self.settings.user_agent.clone(),
        })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub struct HttpByteSource {
    client: Client,
    url: String,
    username: String,
    password: String,
    user_agent: String,
}

impl ByteSource for HttpByteSource {
    fn open(&self) -> Result<Box<dyn Read>> {
        let response = self
            .client
            .get(self.url.as_str())
            .header("User-Agent", self.user_agent.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .with_context(|| format!("failed to download {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download of {} failed with HTTP {status}", self.url);
        }
        Ok(Box::new(response))
    }
}

/// Join a base URL and a server-relative path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::fixtures::{
        MockApi, attachment, blog_post, page, with_attachments, with_children, with_labels,
    };
    use crate::runtime::ResolvedPaths;

    fn tree_api() -> MockApi {
        let mut api = MockApi::with_homepage("1");
        api.insert(with_children(page("1", "Home"), &["2", "5"]));
        api.insert(with_children(page("2", "Guides"), &["3", "4"]));
        api.insert(page("3", "Install"));
        api.insert(page("4", "Upgrade"));
        api.insert(page("5", "About"));
        api
    }

    fn walk(api: &mut MockApi) -> Vec<FetchedContent> {
        PageWalk::new(api)
            .collect::<Result<Vec<_>>>()
            .expect("walk pages")
    }

    #[test]
    fn page_walk_is_depth_first_preorder_with_levels() {
        let mut api = tree_api();
        let pages = walk(&mut api);
        let visited: Vec<(&str, Option<i64>, Option<&str>)> = pages
            .iter()
            .map(|p| (p.id.as_str(), p.level, p.parent_id.as_deref()))
            .collect();
        assert_eq!(
            visited,
            vec![
                ("1", Some(0), None),
                ("2", Some(1), Some("1")),
                ("3", Some(2), Some("2")),
                ("4", Some(2), Some("2")),
                ("5", Some(1), Some("1")),
            ]
        );
    }

    #[test]
    fn refused_page_truncates_only_its_subtree() {
        let mut api = tree_api();
        api.contents.remove("2");
        let pages = walk(&mut api);
        let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "5"]);
    }

    #[test]
    fn missing_homepage_yields_nothing() {
        let mut api = MockApi::default();
        assert!(walk(&mut api).is_empty());
        assert_eq!(api.requests, 1);
    }

    #[test]
    fn page_walk_is_lazy() {
        let mut api = tree_api();
        let mut walker = PageWalk::new(&mut api);
        let first = walker.next().expect("item").expect("page");
        assert_eq!(first.id, "1");
        drop(walker);
        assert_eq!(api.requests, 2);
    }

    #[test]
    fn blog_pager_requests_again_after_exactly_full_page() {
        let mut api = MockApi::default();
        let first: Vec<Value> = (0..BLOG_PAGE_SIZE)
            .map(|n| blog_post(&format!("b{n}"), &format!("Post {n}")))
            .collect();
        api.blog_pages = vec![first, Vec::new()];

        let posts = BlogPager::new(&mut api)
            .collect::<Result<Vec<_>>>()
            .expect("posts");
        assert_eq!(posts.len(), BLOG_PAGE_SIZE);
        assert_eq!(api.searches, vec![0, BLOG_PAGE_SIZE]);
        assert!(posts.iter().all(|post| post.kind == ContentKind::BlogPost));
        assert!(posts.iter().all(|post| post.level.is_none()));
    }

    #[test]
    fn blog_pager_stops_after_short_page() {
        let mut api = MockApi::default();
        let first: Vec<Value> = (0..BLOG_PAGE_SIZE)
            .map(|n| blog_post(&format!("b{n}"), &format!("Post {n}")))
            .collect();
        api.blog_pages = vec![first, vec![blog_post("last", "Last")], vec![blog_post("x", "X")]];

        let posts = BlogPager::new(&mut api)
            .collect::<Result<Vec<_>>>()
            .expect("posts");
        assert_eq!(posts.len(), BLOG_PAGE_SIZE + 1);
        assert_eq!(api.searches, vec![0, BLOG_PAGE_SIZE]);
    }

    #[test]
    fn blog_pager_stops_on_refused_request() {
        let mut api = MockApi::default();
        let posts = BlogPager::new(&mut api)
            .collect::<Result<Vec<_>>>()
            .expect("posts");
        assert!(posts.is_empty());
        assert_eq!(api.searches, vec![0]);
    }

    #[test]
    fn fetched_content_carries_labels_and_deferred_attachments() {
        let api = MockApi::default();
        let payload = with_attachments(
            with_labels(page("7", "Specs"), &["menu", "draft"]),
            vec![attachment("att70", "7", "manual.pdf", 4, 1)],
        );
        let (content, children) =
            FetchedContent::from_payload(&api, payload, Some(1), Some("1".to_string()))
                .expect("build");
        assert!(children.is_empty());
        assert_eq!(content.labels, vec!["menu".to_string(), "draft".to_string()]);
        assert_eq!(content.attachments.len(), 1);
        assert_eq!(content.attachments[0].id, "att70");
        assert_eq!(content.attachments[0].parent_id, "7");
        assert_eq!(api.opens.get(), 0);
    }

    #[test]
    fn malformed_attachment_listing_is_an_error() {
        let api = MockApi::default();
        let payload = with_attachments(page("7", "Specs"), vec![json!({"id": "att1"})]);
        let error = FetchedContent::from_payload(&api, payload, Some(1), None)
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("malformed attachment payload"));
    }

    #[test]
    fn fetch_into_store_is_idempotent_and_skips_unchanged_downloads() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));

        let mut api = MockApi::with_homepage("1");
        api.insert(with_children(page("1", "Home"), &["2"]));
        api.insert(with_attachments(
            page("2", "Guides"),
            vec![attachment("att20", "2", "guide.pdf", 5, 1)],
        ));
        api.files = BTreeMap::from([(
            "/download/attachments/2/guide.pdf?version=1&api=v2".to_string(),
            b"guide".to_vec(),
        )]);
        api.blog_pages = vec![vec![blog_post("b1", "Hello")]];

        let mut store = Store::open(&paths).expect("open store");
        let first = fetch_into_store(&mut api, &mut store).expect("first fetch");
        assert_eq!(first.pages, 2);
        assert_eq!(first.blog_posts, 1);
        assert_eq!(first.attachments_downloaded, 1);
        assert_eq!(first.gc.total(), 0);
        drop(store);

        let mut store = Store::open(&paths).expect("reopen store");
        let second = fetch_into_store(&mut api, &mut store).expect("second fetch");
        assert_eq!(second.attachments_downloaded, 0);
        assert_eq!(second.attachments_reused, 1);
        assert_eq!(second.gc.total(), 0);
        assert_eq!(api.opens.get(), 1);

        let stats = store.stats().expect("stats");
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.blog_posts, 1);
        assert_eq!(stats.attachments, 1);
    }

    #[test]
    fn failed_download_is_counted_and_run_continues() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));
        let mut api = MockApi::with_homepage("1");
        api.insert(with_attachments(
            page("1", "Home"),
            vec![attachment("att10", "1", "missing.png", 3, 1)],
        ));

        let mut store = Store::open(&paths).expect("open store");
        let report = fetch_into_store(&mut api, &mut store).expect("fetch");
        assert_eq!(report.pages, 1);
        assert_eq!(report.attachments_failed, 1);
        assert_eq!(store.stats().expect("stats").attachments, 0);
    }

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://conf.example.com/", "/rest/api/content/1"),
            "https://conf.example.com/rest/api/content/1"
        );
        assert_eq!(
            join_url("https://conf.example.com/wiki", "rest/api/space/HOME"),
            "https://conf.example.com/wiki/rest/api/space/HOME"
        );
    }
}
