use std::collections::BTreeMap;

/// Export-relative destination paths keyed by content ID, attachment ID,
/// bare attachment title and `"<contentID>/<title>"`.
pub type ExportMapping = BTreeMap<String, String>;

pub const PAGES_DIR: &str = "pages";
pub const ARTICLES_DIR: &str = "articles";

const PAGES_URL_PREFIX: &str = "/pages/";

/// How export paths are turned into site URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStyle {
    /// `/a/b.html` becomes `/a/b/`.
    pub convert_to_index_html: bool,
    /// `/pages/a/` becomes `/a/`.
    pub remove_pages_from_url: bool,
}

impl Default for LinkStyle {
    fn default() -> Self {
        Self {
            convert_to_index_html: true,
            remove_pages_from_url: true,
        }
    }
}

impl LinkStyle {
    pub fn plain() -> Self {
        Self {
            convert_to_index_html: false,
            remove_pages_from_url: false,
        }
    }

    /// Absolute site URL for an export-relative document path.
    pub fn page_url(self, export_path: &str) -> String {
        let mut url = absolute(export_path);
        if self.convert_to_index_html
            && let Some(stem) = url.strip_suffix(".html")
        {
            url = format!("{stem}/");
        }
        self.strip_pages(url)
    }

    /// Absolute site URL for an export-relative file; only the prefix rule applies.
    pub fn file_url(self, export_path: &str) -> String {
        self.strip_pages(absolute(export_path))
    }

    fn strip_pages(self, url: String) -> String {
        if self.remove_pages_from_url && url.starts_with(PAGES_URL_PREFIX) {
            return url[PAGES_URL_PREFIX.len() - 1..].to_string();
        }
        url
    }
}

fn absolute(export_path: &str) -> String {
    format!("/{}", export_path.trim_start_matches('/'))
}

/// Path to `target` as seen from `base`, both export-relative.
///
/// `base` is treated as a directory, matching how index-style URLs resolve
/// (`/pages/a.html` is served as `/pages/a/`).
pub fn relative_path(target: &str, base: &str) -> String {
    let target_parts = components(target);
    let base_parts = components(base);
    let common = target_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(left, right)| left == right)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    parts.extend(std::iter::repeat_n("..", base_parts.len() - common));
    parts.extend(&target_parts[common..]);
    if parts.is_empty() {
        return ".".to_string();
    }
    parts.join("/")
}

fn components(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

/// Target ID of a "view page by ID" link.
pub fn page_id_from_href(href: &str) -> Option<&str> {
    if !href.contains("viewpage.action?pageId=") {
        return None;
    }
    let tail = href.rsplit("pageId=").next()?;
    let id = tail.split('&').next()?.trim();
    if id.is_empty() { None } else { Some(id) }
}

/// Trailing file name of a download URL, without its query string.
pub fn file_name_from_src(src: &str) -> Option<&str> {
    let last = src.rsplit('/').next()?;
    let name = last.split('?').next()?;
    if name.is_empty() { None } else { Some(name) }
}
