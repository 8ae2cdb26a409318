//! Typed views over the raw JSON documents returned by the content API.
//!
//! The store keeps payloads verbatim; these structs name the fields the rest
//! of the crate reads and double as the shape check for incoming records.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use serde_json::Value;

pub const KIND_PAGE: &str = "page";
pub const KIND_BLOGPOST: &str = "blogpost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Page,
    BlogPost,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => KIND_PAGE,
            Self::BlogPost => KIND_BLOGPOST,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            KIND_PAGE => Ok(Self::Page),
            KIND_BLOGPOST => Ok(Self::BlogPost),
            other => bail!("unsupported content type: {other} (expected page|blogpost)"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub version: VersionInfo,
    pub history: HistoryInfo,
    #[serde(default)]
    pub body: Option<BodyInfo>,
    #[serde(default)]
    pub metadata: Option<MetadataInfo>,
    #[serde(default)]
    pub children: Option<ChildrenInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub number: i64,
    pub when: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryInfo {
    #[serde(rename = "createdDate")]
    pub created_date: String,
    #[serde(rename = "createdBy", default)]
    pub created_by: Option<UserInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BodyInfo {
    #[serde(default)]
    pub export_view: Option<RenderedBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderedBody {
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataInfo {
    #[serde(default)]
    pub labels: Option<Listing<LabelInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelInfo {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildrenInfo {
    #[serde(default)]
    pub page: Option<Listing<ChildRef>>,
    #[serde(default)]
    pub attachment: Option<Listing<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildRef {
    pub id: String,
}

/// One page of a paginated collection as the API embeds it.
#[derive(Debug, Clone, Deserialize)]
pub struct Listing<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl<T> Listing<T> {
    pub fn returned(&self) -> usize {
        self.size.unwrap_or(self.results.len())
    }

    /// A listing that filled its limit may have been cut short by the server.
    pub fn possibly_truncated(&self) -> bool {
        self.limit.is_some_and(|limit| self.returned() >= limit)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentDocument {
    pub id: String,
    pub title: String,
    pub version: VersionInfo,
    pub history: HistoryInfo,
    pub extensions: AttachmentExtensions,
    #[serde(rename = "_links")]
    pub links: AttachmentLinks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentExtensions {
    #[serde(rename = "fileSize")]
    pub file_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentLinks {
    pub download: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceDocument {
    pub homepage: ChildRef,
}

impl ContentDocument {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        if !payload.is_object() {
            bail!("malformed content payload: expected a JSON object");
        }
        serde_json::from_value(payload.clone()).context("malformed content payload")
    }

    pub fn content_kind(&self) -> Result<ContentKind> {
        ContentKind::parse(&self.kind)
            .with_context(|| format!("malformed content payload for {}", self.id))
    }

    pub fn created(&self) -> Result<DateTime<FixedOffset>> {
        parse_timestamp(&self.history.created_date)
            .with_context(|| format!("invalid history.createdDate for {}", self.id))
    }

    pub fn modified(&self) -> Result<DateTime<FixedOffset>> {
        parse_timestamp(&self.version.when)
            .with_context(|| format!("invalid version.when for {}", self.id))
    }

    pub fn author(&self) -> &str {
        self.history
            .created_by
            .as_ref()
            .and_then(|user| user.username.as_deref())
            .unwrap_or("")
    }

    pub fn export_body(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.export_view.as_ref())
            .and_then(|view| view.value.as_deref())
    }

    pub fn label_listing(&self) -> Option<&Listing<LabelInfo>> {
        self.metadata.as_ref().and_then(|meta| meta.labels.as_ref())
    }

    pub fn labels(&self) -> Vec<String> {
        self.label_listing()
            .map(|listing| listing.results.iter().map(|label| label.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn child_page_ids(&self) -> Vec<String> {
        self.children
            .as_ref()
            .and_then(|children| children.page.as_ref())
            .map(|listing| listing.results.iter().map(|child| child.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn attachment_listing(&self) -> Option<&Listing<Value>> {
        self.children
            .as_ref()
            .and_then(|children| children.attachment.as_ref())
    }
}

impl AttachmentDocument {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        if !payload.is_object() {
            bail!("malformed attachment payload: expected a JSON object");
        }
        let document: Self =
            serde_json::from_value(payload.clone()).context("malformed attachment payload")?;
        if document.title.is_empty()
            || document.title.contains(['/', '\\'])
            || document.title == "."
            || document.title == ".."
        {
            bail!(
                "malformed attachment payload for {}: unusable file name {:?}",
                document.id,
                document.title
            );
        }
        Ok(document)
    }

    pub fn created(&self) -> Result<DateTime<FixedOffset>> {
        parse_timestamp(&self.history.created_date)
            .with_context(|| format!("invalid history.createdDate for {}", self.id))
    }

    pub fn modified(&self) -> Result<DateTime<FixedOffset>> {
        parse_timestamp(&self.version.when)
            .with_context(|| format!("invalid version.when for {}", self.id))
    }
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.trim())
        .with_context(|| format!("invalid RFC 3339 timestamp: {value}"))
}
