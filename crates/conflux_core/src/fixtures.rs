//! Payload builders and an in-memory content source shared by unit tests.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::rc::Rc;

use anyhow::{Result, bail};
use serde_json::{Value, json};

use crate::source::{ByteSource, ContentApi, FetchedContent, SearchPage};

pub(crate) fn content(id: &str, kind: &str, title: &str, created: &str) -> Value {
    json!({
        "id": id,
        "type": kind,
        "title": title,
        "version": {"number": 1, "when": created},
        "history": {"createdDate": created, "createdBy": {"username": "admin"}},
        "body": {"export_view": {"value": format!("<p>{title}</p>")}},
        "metadata": {"labels": {"results": [], "size": 0, "limit": 200}},
        "children": {
            "page": {"results": [], "size": 0, "limit": 25},
            "attachment": {"results": [], "size": 0, "limit": 25}
        }
    })
}

pub(crate) fn page(id: &str, title: &str) -> Value {
    content(id, "page", title, "2018-08-17T09:19:31.000+10:00")
}

pub(crate) fn blog_post(id: &str, title: &str) -> Value {
    content(id, "blogpost", title, "2020-03-01T12:00:00.000Z")
}

pub(crate) fn with_children(mut payload: Value, ids: &[&str]) -> Value {
    let results: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
    payload["children"]["page"] = json!({"results": results, "size": ids.len(), "limit": 25});
    payload
}

pub(crate) fn with_labels(mut payload: Value, labels: &[&str]) -> Value {
    let results: Vec<Value> = labels.iter().map(|name| json!({"name": name})).collect();
    payload["metadata"]["labels"] =
        json!({"results": results, "size": labels.len(), "limit": 200});
    payload
}

pub(crate) fn with_attachments(mut payload: Value, attachments: Vec<Value>) -> Value {
    let size = attachments.len();
    payload["children"]["attachment"] =
        json!({"results": attachments, "size": size, "limit": 25});
    payload
}

pub(crate) fn with_body(mut payload: Value, body: Option<&str>) -> Value {
    payload["body"]["export_view"]["value"] = match body {
        Some(body) => Value::String(body.to_string()),
        None => Value::Null,
    };
    payload
}

pub(crate) fn attachment(id: &str, parent_id: &str, title: &str, size: u64, version: i64) -> Value {
    json!({
        "id": id,
        "title": title,
        "version": {"number": version, "when": "2018-08-17T09:19:31.000+10:00"},
        "history": {"createdDate": "2018-08-17T09:19:31.000+10:00"},
        "extensions": {"fileSize": size},
        "_links": {"download": download_link(parent_id, title, version)}
    })
}

pub(crate) fn download_link(parent_id: &str, title: &str, version: i64) -> String {
    format!("/download/attachments/{parent_id}/{title}?version={version}&api=v2")
}

/// Build a fetched record directly, without walking a tree.
pub(crate) fn fetched(
    api: &MockApi,
    payload: Value,
    level: Option<i64>,
    parent_id: Option<&str>,
) -> FetchedContent {
    FetchedContent::from_payload(api, payload, level, parent_id.map(str::to_string))
        .expect("fetched content")
        .0
}

pub(crate) struct MemorySource {
    bytes: Option<Vec<u8>>,
    opens: Rc<Cell<usize>>,
}

impl ByteSource for MemorySource {
    fn open(&self) -> Result<Box<dyn Read>> {
        self.opens.set(self.opens.get() + 1);
        match &self.bytes {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => bail!("download failed with HTTP 404 Not Found"),
        }
    }
}

#[derive(Default)]
pub(crate) struct MockApi {
    pub homepage: Option<String>,
    pub contents: BTreeMap<String, Value>,
    pub blog_pages: Vec<Vec<Value>>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub opens: Rc<Cell<usize>>,
    pub searches: Vec<usize>,
    pub requests: usize,
}

impl MockApi {
    pub fn with_homepage(id: &str) -> Self {
        Self {
            homepage: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn insert(&mut self, payload: Value) {
        let id = payload["id"].as_str().expect("payload id").to_string();
        self.contents.insert(id, payload);
    }
}

impl ContentApi for MockApi {
    fn homepage_id(&mut self) -> Result<Option<String>> {
        self.requests += 1;
        Ok(self.homepage.clone())
    }

    fn get_content(&mut self, id: &str) -> Result<Option<Value>> {
        self.requests += 1;
        Ok(self.contents.get(id).cloned())
    }

    fn search_blog_posts(&mut self, start: usize, limit: usize) -> Result<Option<SearchPage>> {
        self.requests += 1;
        self.searches.push(start);
        Ok(self.blog_pages.get(start / limit).map(|results| SearchPage {
            size: Some(results.len()),
            results: results.clone(),
        }))
    }

    fn attachment_stream(&self, download_link: &str) -> Box<dyn ByteSource> {
        Box::new(MemorySource {
            bytes: self.files.get(download_link).cloned(),
            opens: Rc::clone(&self.opens),
        })
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}
