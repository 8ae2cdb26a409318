use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::ConfluxConfig;
use crate::hierarchy::{ContentIndex, TITLE_CHAIN_DELIMITER};
use crate::links::{ARTICLES_DIR, ExportMapping, LinkStyle, PAGES_DIR};
use crate::menu::{MenuBuilder, MenuOutput};
use crate::model::ContentKind;
use crate::rewrite::Rewriter;
use crate::runtime::{ResolvedPaths, normalize_for_display};
use crate::store::{AttachmentRecord, ContentRecord, Store, StoredContent};

/// Pages at this level and below are exported; the space homepage sits above it.
pub const FIRST_EXPORTED_LEVEL: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub link_style: LinkStyle,
}

impl ExportOptions {
    pub fn from_config(config: &ConfluxConfig) -> Self {
        Self {
            link_style: LinkStyle {
                convert_to_index_html: config.export.convert_to_index_html,
                remove_pages_from_url: config.export.remove_pages_from_url,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub pages: usize,
    pub blog_posts: usize,
    pub attachments_linked: usize,
    pub attachments_missing: usize,
    pub menu_entries: usize,
    pub sections: usize,
    pub settings_path: PathBuf,
}

enum PlannedItem<'r> {
    File {
        destination: String,
        attachment: &'r AttachmentRecord,
    },
    Document {
        destination: String,
        record: &'r ContentRecord,
    },
}

/// Destination of every record and attachment, fixed before anything is written.
struct ExportPlan<'r> {
    mapping: ExportMapping,
    items: Vec<PlannedItem<'r>>,
}

impl<'r> ExportPlan<'r> {
    fn build<I>(records: I, index: &ContentIndex) -> Self
    where
        I: IntoIterator<Item = &'r StoredContent>,
    {
        let mut mapping = ExportMapping::new();
        let mut page_dirs: BTreeMap<&'r str, String> = BTreeMap::new();
        let mut items = Vec::new();

        for stored in records {
            let record = &stored.record;
            debug!(
                "processing [{}] {}",
                record.id,
                index
                    .title_chain(&record.id, TITLE_CHAIN_DELIMITER)
                    .unwrap_or_else(|| record.title.clone())
            );

            let slug = slug_or_id(record);
            let directory = match record.kind {
                ContentKind::BlogPost => {
                    format!("{ARTICLES_DIR}/{}/{slug}", record.created.format("%Y"))
                }
                ContentKind::Page => {
                    let directory = match record
                        .parent_id
                        .as_deref()
                        .and_then(|parent| page_dirs.get(parent))
                    {
                        Some(parent_dir) => format!("{parent_dir}/{slug}"),
                        None => format!("{PAGES_DIR}/{slug}"),
                    };
                    page_dirs.insert(record.id.as_str(), directory.clone());
                    directory
                }
            };
            let document = format!("{directory}.html");
            mapping.insert(record.id.clone(), document.clone());

            for attachment in &stored.attachments {
                let file = format!("{directory}/{}", attachment.title);
                mapping.insert(attachment.id.clone(), file.clone());
                mapping.insert(attachment.title.clone(), file.clone());
                mapping.insert(format!("{}/{}", record.id, attachment.title), file.clone());
                items.push(PlannedItem::File {
                    destination: file,
                    attachment,
                });
            }
            items.push(PlannedItem::Document {
                destination: document,
                record,
            });
        }

        Self { mapping, items }
    }
}

fn slug_or_id(record: &ContentRecord) -> &str {
    if record.slug.is_empty() {
        &record.id
    } else {
        &record.slug
    }
}

/// Writes the site generator's input tree from the store.
pub struct Exporter {
    paths: ResolvedPaths,
    options: ExportOptions,
}

impl Exporter {
    pub fn new(paths: &ResolvedPaths, options: ExportOptions) -> Self {
        Self {
            paths: paths.clone(),
            options,
        }
    }

    /// Rebuild `exports/` from scratch and write the menu settings file.
    pub fn export(&self, store: &Store) -> Result<ExportReport> {
        let exports_dir = &self.paths.exports_dir;
        debug!("removing old exports: {}", normalize_for_display(exports_dir));
        if exports_dir.exists() {
            fs::remove_dir_all(exports_dir)
                .with_context(|| format!("failed to remove {}", exports_dir.display()))?;
        }
        fs::create_dir_all(exports_dir)
            .with_context(|| format!("failed to create {}", exports_dir.display()))?;

        let roots = store.iter_pages(0, FIRST_EXPORTED_LEVEL - 1)?;
        let pages = store.iter_pages(FIRST_EXPORTED_LEVEL, i64::MAX)?;
        let blog = store.iter_blog()?;
        let index = ContentIndex::from_records(
            roots
                .iter()
                .chain(&pages)
                .chain(&blog)
                .map(|stored| &stored.record),
        );

        let plan = ExportPlan::build(pages.iter().chain(&blog), &index);
        let mut report = ExportReport {
            pages: pages.len(),
            blog_posts: blog.len(),
            settings_path: self.paths.export_settings_path.clone(),
            ..ExportReport::default()
        };

        for item in &plan.items {
            match item {
                PlannedItem::File {
                    destination,
                    attachment,
                } => {
                    if self.link_attachment(attachment, destination)? {
                        report.attachments_linked += 1;
                    } else {
                        report.attachments_missing += 1;
                    }
                }
                PlannedItem::Document {
                    destination,
                    record,
                } => self.write_document(record, destination, &plan.mapping)?,
            }
        }

        let menu = MenuBuilder::new(
            pages.iter().map(|stored| &stored.record),
            &plan.mapping,
            self.options.link_style,
        )
        .build();
        report.menu_entries = menu.menu.len();
        report.sections = menu.section_menus.len();
        write_settings(&self.paths.export_settings_path, &menu)?;

        info!(
            pages = report.pages,
            blog_posts = report.blog_posts,
            attachments = report.attachments_linked,
            "export complete"
        );
        Ok(report)
    }

    /// Hard-link the cached copy into place. Returns false when the cache has no file.
    fn link_attachment(&self, attachment: &AttachmentRecord, destination: &str) -> Result<bool> {
        let source = self.paths.data_dir.join(&attachment.path_current);
        if !source.is_file() {
            warn!(
                id = %attachment.id,
                "cached file missing: {}",
                normalize_for_display(&source)
            );
            return Ok(false);
        }
        let link = self.paths.exports_dir.join(destination);
        ensure_parent(&link)?;
        clear_destination(&link)?;
        fs::hard_link(&source, &link).with_context(|| {
            format!(
                "failed to link {} to {}",
                source.display(),
                link.display()
            )
        })?;
        Ok(true)
    }

    fn write_document(
        &self,
        record: &ContentRecord,
        destination: &str,
        mapping: &ExportMapping,
    ) -> Result<()> {
        let mut rewriter =
            Rewriter::from_record(record, destination, mapping, self.options.link_style)
                .with_context(|| format!("failed to prepare {} for export", record.id))?;
        rewriter
            .apply_all()
            .with_context(|| format!("failed to rewrite {}", record.id))?;

        let path = self.paths.exports_dir.join(destination);
        ensure_parent(&path)?;
        clear_destination(&path)?;
        debug!("writing {}", normalize_for_display(&path));
        fs::write(&path, rewriter.into_html())
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn write_settings(path: &Path, menu: &MenuOutput) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(menu).context("failed to serialize export settings")?;
    ensure_parent(path)?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

/// Unlink whatever already sits at `path`. Writing through an existing hard
/// link would change the cached attachment it shares an inode with.
fn clear_destination(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path).with_context(|| format!("failed to replace {}", path.display()))?;
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};
    use tempfile::tempdir;

    use super::*;
    use crate::fixtures::{
        MockApi, attachment, blog_post, download_link, page, with_attachments, with_body,
        with_children, with_labels,
    };
    use crate::source::fetch_into_store;

    fn populated_store(paths: &ResolvedPaths) -> Store {
        let mut api = MockApi::with_homepage("1");
        api.insert(with_children(page("1", "Home"), &["2"]));
        api.insert(with_body(
            with_labels(with_children(page("2", "Guides"), &["3"]), &["menu"]),
            Some(r#"<p><a href="https://conf.example.com/pages/viewpage.action?pageId=4">Linux</a></p>"#),
        ));
        api.insert(with_attachments(
            with_children(page("3", "Install"), &["4"]),
            vec![attachment("att30", "3", "setup.sh", 4, 1)],
        ));
        api.insert(page("4", "Linux"));

        let mut older = blog_post("b1", "Year In Review");
        older["history"]["createdDate"] = json!("2019-12-31T23:00:00.000+02:00");
        let newer = with_body(
            with_attachments(
                blog_post("b2", "Hello World"),
                vec![attachment("att90", "b2", "diagram.png", 3, 2)],
            ),
            Some(r#"<span class="confluence-embedded-file-wrapper"><img class="confluence-embedded-image" src="https://conf.example.com/download/attachments/b2/diagram.png?api=v2"></span>"#),
        );
        api.blog_pages = vec![vec![older, newer]];
        api.files = BTreeMap::from([
            (download_link("3", "setup.sh", 1), b"echo".to_vec()),
            (download_link("b2", "diagram.png", 2), b"png".to_vec()),
        ]);

        let mut store = Store::open(paths).expect("open store");
        fetch_into_store(&mut api, &mut store).expect("fetch");
        store
    }

    #[test]
    fn export_writes_expected_layout() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));
        let store = populated_store(&paths);

        let stale = paths.exports_dir.join("pages/stale.html");
        fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        fs::write(&stale, "old").expect("write stale");

        let report = Exporter::new(&paths, ExportOptions::default())
            .export(&store)
            .expect("export");
        assert_eq!(report.pages, 3);
        assert_eq!(report.blog_posts, 2);
        assert_eq!(report.attachments_linked, 2);
        assert_eq!(report.attachments_missing, 0);

        let exports = &paths.exports_dir;
        for expected in [
            "pages/guides.html",
            "pages/guides/install.html",
            "pages/guides/install/linux.html",
            "pages/guides/install/setup.sh",
            "articles/2019/year-in-review.html",
            "articles/2020/hello-world.html",
            "articles/2020/hello-world/diagram.png",
        ] {
            assert!(exports.join(expected).is_file(), "missing {expected}");
        }
        assert!(!stale.exists());
        assert!(!exports.join("pages/home.html").exists());
        assert_eq!(
            fs::read(exports.join("pages/guides/install/setup.sh")).expect("read"),
            b"echo"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let cached = fs::metadata(paths.data_dir.join("attachments/att30/1/setup.sh"))
                .expect("cached");
            let linked =
                fs::metadata(exports.join("pages/guides/install/setup.sh")).expect("linked");
            assert_eq!(cached.ino(), linked.ino());
        }
    }

    #[test]
    fn links_resolve_to_records_processed_later() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));
        let store = populated_store(&paths);
        Exporter::new(&paths, ExportOptions::default())
            .export(&store)
            .expect("export");

        let guides = fs::read_to_string(paths.exports_dir.join("pages/guides.html")).expect("read");
        assert!(guides.contains(r#"href="/guides/install/linux/""#));

        let post = fs::read_to_string(paths.exports_dir.join("articles/2020/hello-world.html"))
            .expect("read");
        assert!(post.contains(r#"src="/articles/2020/hello-world/diagram.png""#));
        assert!(post.contains(r#"class="embedded-image""#));
    }

    #[test]
    fn settings_file_holds_menu_structures() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));
        let store = populated_store(&paths);
        let report = Exporter::new(&paths, ExportOptions::default())
            .export(&store)
            .expect("export");
        assert_eq!(report.menu_entries, 1);
        assert_eq!(report.sections, 1);

        let settings: Value = serde_json::from_str(
            &fs::read_to_string(&paths.export_settings_path).expect("read settings"),
        )
        .expect("parse settings");
        assert_eq!(settings["MENU_HIERARCHY"][0][0], json!("Guides"));
        assert_eq!(settings["MENU_HIERARCHY"][0][1], json!("/guides/"));
        assert_eq!(settings["MENU_HIERARCHY"][0][2][0][0], json!("Install"));
        assert_eq!(settings["HIERARCHY_MENU_MAP"]["/guides/install/linux/"], json!("2"));
        assert_eq!(settings["HIERARCHY_MENUS"]["2"][0][0], json!("Guides"));
    }

    #[test]
    fn plain_link_style_keeps_html_paths() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));
        let store = populated_store(&paths);
        let options = ExportOptions {
            link_style: LinkStyle::plain(),
        };
        Exporter::new(&paths, options).export(&store).expect("export");

        let guides = fs::read_to_string(paths.exports_dir.join("pages/guides.html")).expect("read");
        assert!(guides.contains(r#"href="/pages/guides/install/linux.html""#));
    }

    #[test]
    fn missing_cached_file_is_skipped() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));
        let store = populated_store(&paths);
        fs::remove_file(paths.data_dir.join("attachments/att30/1/setup.sh")).expect("remove");

        let report = Exporter::new(&paths, ExportOptions::default())
            .export(&store)
            .expect("export");
        assert_eq!(report.attachments_linked, 1);
        assert_eq!(report.attachments_missing, 1);
    }

    #[test]
    fn document_sharing_an_attachment_path_leaves_cache_intact() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_data_dir(&temp.path().join("data"));

        let mut api = MockApi::with_homepage("1");
        api.insert(with_children(page("1", "Home"), &["2"]));
        api.insert(with_attachments(
            with_children(page("2", "Guides"), &["3"]),
            vec![attachment("att40", "2", "install.html", 6, 1)],
        ));
        api.insert(page("3", "Install"));
        api.files = BTreeMap::from([(
            download_link("2", "install.html", 1),
            b"cached".to_vec(),
        )]);
        let mut store = Store::open(&paths).expect("open store");
        fetch_into_store(&mut api, &mut store).expect("fetch");

        Exporter::new(&paths, ExportOptions::default())
            .export(&store)
            .expect("export");

        let cached = paths.data_dir.join("attachments/att40/1/install.html");
        assert_eq!(fs::read(&cached).expect("cached"), b"cached");
        let written = fs::read_to_string(paths.exports_dir.join("pages/guides/install.html"))
            .expect("document");
        assert!(written.contains("<title>Install</title>"));
    }

    #[test]
    fn options_follow_config() {
        let mut config = ConfluxConfig::default();
        config.export.remove_pages_from_url = false;
        let options = ExportOptions::from_config(&config);
        assert!(options.link_style.convert_to_index_html);
        assert!(!options.link_style.remove_pages_from_url);
    }
}
