use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use rslug::slugify;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::migrate::open_migrated;
use crate::model::{
    AttachmentDocument, ContentDocument, ContentKind, KIND_BLOGPOST, KIND_PAGE, parse_timestamp,
};
use crate::runtime::{ResolvedPaths, normalize_for_display};
use crate::source::{ByteSource, FetchedAttachment, FetchedContent};

pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
pub const ATTACHMENTS_DIR: &str = "attachments";

const CONTENT_COLUMNS: &str = "row_id, id, kind, title, slug, level, parent_id, version, created, modified, labels, payload, run, deleted";
const ATTACHMENT_COLUMNS: &str = "row_id, id, parent_id, title, version, size, path_all, path_current, created, modified, payload, run, deleted";

#[derive(Debug, Clone, PartialEq)]
pub struct ContentRecord {
    pub row_id: i64,
    pub id: String,
    pub kind: ContentKind,
    pub title: String,
    pub slug: String,
    pub level: Option<i64>,
    pub parent_id: Option<String>,
    pub version: i64,
    pub created: DateTime<FixedOffset>,
    pub modified: DateTime<FixedOffset>,
    pub labels: Vec<String>,
    pub payload: String,
    pub run: String,
    pub deleted: bool,
}

impl ContentRecord {
    pub fn payload_json(&self) -> Result<Value> {
        serde_json::from_str(&self.payload)
            .with_context(|| format!("stored payload for {} is not valid JSON", self.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
    pub row_id: i64,
    pub id: String,
    pub parent_id: String,
    pub title: String,
    pub version: i64,
    pub size: u64,
    /// Directory holding every stored version, relative to the data directory.
    pub path_all: String,
    /// File of the current version, relative to the data directory.
    pub path_current: String,
    pub created: DateTime<FixedOffset>,
    pub modified: DateTime<FixedOffset>,
    pub payload: String,
    pub run: String,
    pub deleted: bool,
}

/// A content record with the attachments that belong to it.
#[derive(Debug, Clone)]
pub struct StoredContent {
    pub record: ContentRecord,
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentOutcome {
    Downloaded,
    Reused,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub content_removed: usize,
    pub attachments_removed: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.content_removed + self.attachments_removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub pages: usize,
    pub blog_posts: usize,
    pub attachments: usize,
    pub attachment_bytes: u64,
}

/// Local cache of fetched content. Every write is stamped with the run tag
/// generated when the store was opened; `commit` drops whatever this run did
/// not touch.
pub struct Store {
    connection: Connection,
    data_dir: PathBuf,
    run: String,
}

impl Store {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        let (connection, report) = open_migrated(&paths.db_path)?;
        if !report.applied.is_empty() {
            debug!(
                applied = report.applied.len(),
                version = report.current_version,
                "store schema migrated"
            );
        }
        let run = Uuid::new_v4().to_string();
        debug!(%run, db = %normalize_for_display(&paths.db_path), "store opened");
        Ok(Self {
            connection,
            data_dir: paths.data_dir.clone(),
            run,
        })
    }

    pub fn run_tag(&self) -> &str {
        &self.run
    }

    /// Insert or update a page or blog post keyed by its source ID.
    pub fn store_content(&mut self, content: &FetchedContent) -> Result<()> {
        let document = ContentDocument::from_payload(&content.payload)
            .with_context(|| format!("cannot store content {}", content.id))?;
        let kind = document.content_kind()?;
        let created = document.created()?;
        let modified = document.modified()?;
        let slug = slugify!(&document.title);
        let labels = serde_json::to_string(&content.labels).context("failed to encode labels")?;
        let payload =
            serde_json::to_string(&content.payload).context("failed to encode content payload")?;

        self.connection
            .execute(
                "INSERT INTO content (id, kind, title, slug, level, parent_id, version, created, modified, labels, payload, run, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    title = excluded.title,
                    slug = excluded.slug,
                    level = excluded.level,
                    parent_id = excluded.parent_id,
                    version = excluded.version,
                    created = excluded.created,
                    modified = excluded.modified,
                    labels = excluded.labels,
                    payload = excluded.payload,
                    run = excluded.run,
                    deleted = 0",
                params![
                    content.id,
                    kind.as_str(),
                    document.title,
                    slug,
                    content.level,
                    content.parent_id,
                    document.version.number,
                    created.to_rfc3339(),
                    modified.to_rfc3339(),
                    labels,
                    payload,
                    self.run,
                ],
            )
            .with_context(|| format!("failed to store content {}", content.id))?;
        debug!(id = %content.id, title = %document.title, "stored content");
        Ok(())
    }

    /// Make sure the attachment's current version is on disk, then record it.
    pub fn store_attachment(
        &mut self,
        content: &FetchedContent,
        attachment: &FetchedAttachment,
    ) -> Result<AttachmentOutcome> {
        let document = AttachmentDocument::from_payload(&attachment.payload)
            .with_context(|| format!("cannot store attachment {}", attachment.id))?;
        let created = document.created()?;
        let modified = document.modified()?;
        let expected_size = document.extensions.file_size;

        let path_all = format!("{ATTACHMENTS_DIR}/{}", document.id);
        let path_current = format!(
            "{path_all}/{}/{}",
            document.version.number, document.title
        );
        let absolute = self.data_dir.join(&path_current);

        let outcome = match fs::metadata(&absolute) {
            Ok(metadata) if metadata.len() == expected_size => AttachmentOutcome::Reused,
            Ok(metadata) => {
                info!(
                    id = %document.id,
                    title = %document.title,
                    found = metadata.len(),
                    expected = expected_size,
                    "cached attachment has the wrong size; downloading again"
                );
                fs::remove_file(&absolute)
                    .with_context(|| format!("failed to remove {}", absolute.display()))?;
                download(attachment.stream.as_ref(), &absolute)?;
                AttachmentOutcome::Downloaded
            }
            Err(_) => {
                download(attachment.stream.as_ref(), &absolute)?;
                AttachmentOutcome::Downloaded
            }
        };
        if outcome == AttachmentOutcome::Downloaded {
            info!("downloaded attachment: {path_current}");
        }

        let payload = serde_json::to_string(&attachment.payload)
            .context("failed to encode attachment payload")?;
        self.connection
            .execute(
                "INSERT INTO attachment (id, parent_id, title, version, size, path_all, path_current, created, modified, payload, run, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    title = excluded.title,
                    version = excluded.version,
                    size = excluded.size,
                    path_all = excluded.path_all,
                    path_current = excluded.path_current,
                    created = excluded.created,
                    modified = excluded.modified,
                    payload = excluded.payload,
                    run = excluded.run,
                    deleted = 0",
                params![
                    document.id,
                    content.id,
                    document.title,
                    document.version.number,
                    i64::try_from(expected_size).context("attachment size does not fit into i64")?,
                    path_all,
                    path_current,
                    created.to_rfc3339(),
                    modified.to_rfc3339(),
                    payload,
                    self.run,
                ],
            )
            .with_context(|| format!("failed to store attachment {}", document.id))?;
        Ok(outcome)
    }

    /// Delete every record this run did not write.
    pub fn commit(&mut self) -> Result<GcReport> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start garbage collection")?;
        let attachments_removed = transaction
            .execute("DELETE FROM attachment WHERE run != ?1", [&self.run])
            .context("failed to collect stale attachments")?;
        let content_removed = transaction
            .execute("DELETE FROM content WHERE run != ?1", [&self.run])
            .context("failed to collect stale content")?;
        transaction
            .commit()
            .context("failed to commit garbage collection")?;

        let report = GcReport {
            content_removed,
            attachments_removed,
        };
        if report.total() > 0 {
            info!(
                content = report.content_removed,
                attachments = report.attachments_removed,
                "removed records missing from this run"
            );
        }
        Ok(report)
    }

    /// Pages whose level lies in `min_level..=max_level`, shallowest first,
    /// insertion order within a level.
    pub fn iter_pages(&self, min_level: i64, max_level: i64) -> Result<Vec<StoredContent>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM content
             WHERE kind = ?1 AND deleted = 0 AND level >= ?2 AND level <= ?3
             ORDER BY level, row_id"
        );
        let records = self.query_content(&sql, params![KIND_PAGE, min_level, max_level])?;
        self.with_attachments(records)
    }

    pub fn iter_blog(&self) -> Result<Vec<StoredContent>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM content
             WHERE kind = ?1 AND deleted = 0
             ORDER BY level, row_id"
        );
        let records = self.query_content(&sql, params![KIND_BLOGPOST])?;
        self.with_attachments(records)
    }

    pub fn get_content(&self, id: &str) -> Result<Option<ContentRecord>> {
        let sql = format!("SELECT {CONTENT_COLUMNS} FROM content WHERE id = ?1");
        let row = self
            .connection
            .query_row(&sql, [id], ContentRow::from_row)
            .optional()
            .with_context(|| format!("failed to load content {id}"))?;
        row.map(ContentRow::into_record).transpose()
    }

    pub fn attachments_for(&self, parent_id: &str) -> Result<Vec<AttachmentRecord>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachment
             WHERE parent_id = ?1 AND deleted = 0
             ORDER BY row_id"
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare attachment query")?;
        let rows = statement
            .query_map([parent_id], AttachmentRow::from_row)
            .context("failed to query attachments")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read attachment row")?.into_record()?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count_kind = |kind: &str| -> Result<usize> {
            let count: i64 = self
                .connection
                .query_row(
                    "SELECT COUNT(*) FROM content WHERE kind = ?1 AND deleted = 0",
                    [kind],
                    |row| row.get(0),
                )
                .context("failed to count content")?;
            usize::try_from(count).context("content count does not fit into usize")
        };
        let (attachments, bytes): (i64, i64) = self
            .connection
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM attachment WHERE deleted = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count attachments")?;
        Ok(StoreStats {
            pages: count_kind(KIND_PAGE)?,
            blog_posts: count_kind(KIND_BLOGPOST)?,
            attachments: usize::try_from(attachments)
                .context("attachment count does not fit into usize")?,
            attachment_bytes: u64::try_from(bytes).context("attachment bytes are negative")?,
        })
    }

    fn query_content(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ContentRecord>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare content query")?;
        let rows = statement
            .query_map(params, ContentRow::from_row)
            .context("failed to query content")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read content row")?.into_record()?);
        }
        Ok(out)
    }

    fn with_attachments(&self, records: Vec<ContentRecord>) -> Result<Vec<StoredContent>> {
        records
            .into_iter()
            .map(|record| {
                let attachments = self.attachments_for(&record.id)?;
                Ok(StoredContent {
                    record,
                    attachments,
                })
            })
            .collect()
    }
}

/// Stream `source` to `destination` through a sibling `.part` file.
fn download(source: &dyn ByteSource, destination: &Path) -> Result<u64> {
    let parent = destination
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", destination.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let file_name = destination
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", destination.display()))?;
    let mut partial_name = file_name.to_os_string();
    partial_name.push(".part");
    let partial = parent.join(partial_name);

    let result = (|| -> Result<u64> {
        let mut reader = source.open()?;
        let mut file = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error).context("failed to read attachment stream"),
            };
            file.write_all(&buffer[..read])
                .with_context(|| format!("failed to write {}", partial.display()))?;
            written += read as u64;
        }
        file.flush()
            .with_context(|| format!("failed to flush {}", partial.display()))?;
        Ok(written)
    })();

    match result {
        Ok(written) => {
            fs::rename(&partial, destination).with_context(|| {
                format!(
                    "failed to move {} into place at {}",
                    partial.display(),
                    destination.display()
                )
            })?;
            Ok(written)
        }
        Err(error) => {
            if partial.exists()
                && let Err(cleanup) = fs::remove_file(&partial)
            {
                warn!("failed to remove {}: {cleanup}", partial.display());
            }
            Err(error)
        }
    }
}

struct ContentRow {
    row_id: i64,
    id: String,
    kind: String,
    title: String,
    slug: String,
    level: Option<i64>,
    parent_id: Option<String>,
    version: i64,
    created: String,
    modified: String,
    labels: String,
    payload: String,
    run: String,
    deleted: bool,
}

impl ContentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            title: row.get(3)?,
            slug: row.get(4)?,
            level: row.get(5)?,
            parent_id: row.get(6)?,
            version: row.get(7)?,
            created: row.get(8)?,
            modified: row.get(9)?,
            labels: row.get(10)?,
            payload: row.get(11)?,
            run: row.get(12)?,
            deleted: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<ContentRecord> {
        let labels: Vec<String> = serde_json::from_str(&self.labels)
            .with_context(|| format!("stored labels for {} are not a JSON list", self.id))?;
        Ok(ContentRecord {
            kind: ContentKind::parse(&self.kind)?,
            created: parse_timestamp(&self.created)?,
            modified: parse_timestamp(&self.modified)?,
            labels,
            row_id: self.row_id,
            id: self.id,
            title: self.title,
            slug: self.slug,
            level: self.level,
            parent_id: self.parent_id,
            version: self.version,
            payload: self.payload,
            run: self.run,
            deleted: self.deleted,
        })
    }
}

struct AttachmentRow {
    row_id: i64,
    id: String,
    parent_id: String,
    title: String,
    version: i64,
    size: i64,
    path_all: String,
    path_current: String,
    created: String,
    modified: String,
    payload: String,
    run: String,
    deleted: bool,
}

impl AttachmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            id: row.get(1)?,
            parent_id: row.get(2)?,
            title: row.get(3)?,
            version: row.get(4)?,
            size: row.get(5)?,
            path_all: row.get(6)?,
            path_current: row.get(7)?,
            created: row.get(8)?,
            modified: row.get(9)?,
            payload: row.get(10)?,
            run: row.get(11)?,
            deleted: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<AttachmentRecord> {
        Ok(AttachmentRecord {
            size: u64::try_from(self.size)
                .with_context(|| format!("negative size stored for {}", self.id))?,
            created: parse_timestamp(&self.created)?,
            modified: parse_timestamp(&self.modified)?,
            row_id: self.row_id,
            id: self.id,
            parent_id: self.parent_id,
            title: self.title,
            version: self.version,
            path_all: self.path_all,
            path_current: self.path_current,
            payload: self.payload,
            run: self.run,
            deleted: self.deleted,
        })
    }
}
