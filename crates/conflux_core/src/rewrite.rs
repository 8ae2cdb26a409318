use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use html_escape::{decode_html_entities, encode_double_quoted_attribute, encode_text};
use lol_html::html_content::{Element, EndTag};
use lol_html::{ElementContentHandlers, RewriteStrSettings, Selector, element, rewrite_str};
use serde_json::Value;
use tracing::debug;

use crate::links::{
    ExportMapping, LinkStyle, file_name_from_src, page_id_from_href, relative_path,
};
use crate::model::ContentDocument;
use crate::store::ContentRecord;

/// Labels that steer navigation and never show up as tags.
pub const RESERVED_LABELS: [&str; 2] = ["hidden", "menu"];
pub const EMPTY_BODY: &str = "<p>Nothing yet.</p>";

const EMBED_WRAPPER: &str = "span.confluence-embedded-file-wrapper";
const EMBED_CLASS: &str = "embedded-image";
const CODE_BLOCK: &str = "pre.syntaxhighlighter-pre";
const ATTACHMENT_HREF_MARKER: &str = "/download/attachments/";
const IMAGE_SRC_MARKER: &str = "download/attachments";
const LINKED_RESOURCE_PREFIX: &str = "data-linked-resource-";
const NICE_TYPE_ATTRIBUTE: &str = "data-nice-type";

type Handlers<'s, 'h> = Vec<(Cow<'s, Selector>, ElementContentHandlers<'h>)>;

/// Turns one stored record into a standalone HTML document for the site generator.
///
/// The document is synthesized on construction; each operation then rewrites
/// it in place and may be run on its own.
pub struct Rewriter<'a> {
    content_id: String,
    destination: String,
    mapping: &'a ExportMapping,
    style: LinkStyle,
    html: String,
}

impl<'a> Rewriter<'a> {
    pub fn new(
        payload: &Value,
        labels: &[String],
        destination: &str,
        mapping: &'a ExportMapping,
        style: LinkStyle,
    ) -> Result<Self> {
        let document = ContentDocument::from_payload(payload)?;
        Ok(Self {
            html: synthesize_document(&document, labels),
            content_id: document.id,
            destination: destination.to_string(),
            mapping,
            style,
        })
    }

    pub fn from_record(
        record: &ContentRecord,
        destination: &str,
        mapping: &'a ExportMapping,
        style: LinkStyle,
    ) -> Result<Self> {
        Self::new(
            &record.payload_json()?,
            &record.labels,
            destination,
            mapping,
            style,
        )
    }

    /// Run every operation in export order.
    pub fn apply_all(&mut self) -> Result<()> {
        self.remove_styles()?;
        self.convert_page_links()?;
        self.convert_attachment_links()?;
        self.convert_code_to_prettyprint()?;
        self.replace_embedded_images()
    }

    pub fn generate_html(&self) -> String {
        self.html.clone()
    }

    pub fn into_html(self) -> String {
        self.html
    }

    pub fn remove_styles(&mut self) -> Result<()> {
        self.rewrite(
            "remove style blocks",
            vec![element!("style", |el| {
                el.remove();
                Ok(())
            })],
        )
    }

    pub fn convert_page_links(&mut self) -> Result<()> {
        let mapping = self.mapping;
        let style = self.style;
        self.rewrite(
            "convert page links",
            vec![element!("a[href]", |el| {
                let Some(href) = decoded_attribute(el, "href") else {
                    return Ok(());
                };
                let Some(page_id) = page_id_from_href(&href) else {
                    return Ok(());
                };
                match mapping.get(page_id) {
                    Some(path) => el.set_attribute("href", &style.page_url(path))?,
                    None => debug!(%page_id, "page link target was not exported; left as is"),
                }
                Ok(())
            })],
        )
    }

    pub fn convert_attachment_links(&mut self) -> Result<()> {
        let mapping = self.mapping;
        let destination = self.destination.as_str();
        let rewritten = apply(
            &self.html,
            "convert attachment links",
            vec![element!("a", |el| {
                if let Some(href) = decoded_attribute(el, "href")
                    && href.contains(ATTACHMENT_HREF_MARKER)
                    && let Some(resource) = decoded_attribute(el, "data-linked-resource-id")
                {
                    let key = format!("att{resource}");
                    match mapping.get(&key) {
                        Some(path) => el.set_attribute("href", &relative_path(path, destination))?,
                        None => debug!(%key, "attachment link target was not exported; left as is"),
                    }
                }

                let auxiliary: Vec<String> = el
                    .attributes()
                    .iter()
                    .map(|attribute| attribute.name())
                    .filter(|name| {
                        name.starts_with(LINKED_RESOURCE_PREFIX) || name == NICE_TYPE_ATTRIBUTE
                    })
                    .collect();
                for name in auxiliary {
                    el.remove_attribute(&name);
                }
                Ok(())
            })],
        )?;
        self.html = rewritten;
        Ok(())
    }

    pub fn replace_embedded_images(&mut self) -> Result<()> {
        let wrappers = wrappers_with_images(&self.html)?;

        let mapping = self.mapping;
        let style = self.style;
        let content_id = self.content_id.as_str();
        let ordinal = Cell::new(0usize);
        let rewritten = apply(
            &self.html,
            "replace embedded images",
            vec![
                element!(EMBED_WRAPPER, |el| {
                    let current = ordinal.get();
                    ordinal.set(current + 1);
                    if wrappers.contains(&current) {
                        el.set_attribute("class", EMBED_CLASS)?;
                    }
                    Ok(())
                }),
                element!("img", |el| {
                    el.remove_attribute("class");
                    let Some(src) = decoded_attribute(el, "src") else {
                        return Ok(());
                    };
                    if !src.contains(IMAGE_SRC_MARKER) {
                        return Ok(());
                    }
                    let Some(file) = file_name_from_src(&src) else {
                        return Ok(());
                    };
                    match lookup_image(mapping, content_id, file) {
                        Some(path) => el.set_attribute("src", &style.file_url(path))?,
                        None => debug!(%file, "embedded image was not exported; left as is"),
                    }
                    Ok(())
                }),
            ],
        )?;
        self.html = rewritten;
        Ok(())
    }

    pub fn convert_code_to_prettyprint(&mut self) -> Result<()> {
        self.rewrite(
            "convert code blocks",
            vec![element!(CODE_BLOCK, |el| {
                let params = decoded_attribute(el, "data-syntaxhighlighter-params")
                    .map(|raw| parse_syntax_params(&raw))
                    .unwrap_or_default();
                let class = match params.get("brush") {
                    Some(brush) => format!("prettyprint lang-{brush}"),
                    None => "prettyprint".to_string(),
                };
                el.set_attribute("class", &class)?;
                Ok(())
            })],
        )
    }

    fn rewrite(&mut self, operation: &str, handlers: Handlers<'_, '_>) -> Result<()> {
        self.html = apply(&self.html, operation, handlers)?;
        Ok(())
    }
}

fn apply(html: &str, operation: &str, handlers: Handlers<'_, '_>) -> Result<String> {
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|error| anyhow!("failed to {operation}: {error}"))
}

/// lol_html hands attribute values back with character references intact.
fn decoded_attribute(el: &Element<'_, '_>, name: &str) -> Option<String> {
    el.get_attribute(name)
        .map(|raw| decode_html_entities(&raw).into_owned())
}

/// Ordinals, in document order, of the embed wrappers that contain at least one image.
fn wrappers_with_images(html: &str) -> Result<BTreeSet<usize>> {
    let open: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let marked: RefCell<BTreeSet<usize>> = RefCell::new(BTreeSet::new());
    let ordinal = Cell::new(0usize);

    apply(
        html,
        "find embedded images",
        vec![
            element!(EMBED_WRAPPER, |el| {
                let current = ordinal.get();
                ordinal.set(current + 1);
                if let Some(handlers) = el.end_tag_handlers() {
                    open.borrow_mut().push(current);
                    let open = Rc::clone(&open);
                    handlers.push(Box::new(
                        move |_end: &mut EndTag<'_>| -> Result<(), Box<dyn Error + Send + Sync>> {
                            open.borrow_mut().pop();
                            Ok(())
                        },
                    ));
                }
                Ok(())
            }),
            element!("img", |_el| {
                marked.borrow_mut().extend(open.borrow().iter().copied());
                Ok(())
            }),
        ],
    )?;
    Ok(marked.into_inner())
}

/// Composite `"<contentID>/<file>"` first, then the bare file name. With the
/// same file name attached to several pages the bare key resolves to
/// whichever was mapped last.
fn lookup_image<'m>(mapping: &'m ExportMapping, content_id: &str, name: &str) -> Option<&'m str> {
    mapping
        .get(&format!("{content_id}/{name}"))
        .or_else(|| mapping.get(name))
        .map(String::as_str)
}

/// Parse `brush: java; gutter: false` style parameters. Pairs without a colon
/// or with an empty key are skipped.
pub fn parse_syntax_params(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn synthesize_document(document: &ContentDocument, labels: &[String]) -> String {
    let tags = labels
        .iter()
        .map(String::as_str)
        .filter(|label| !RESERVED_LABELS.contains(label))
        .collect::<Vec<_>>()
        .join(",");
    let body = document
        .export_body()
        .filter(|body| !body.trim().is_empty())
        .unwrap_or(EMPTY_BODY);

    format!(
        "<html><head><title>{title}</title>\
         <meta name=\"date\" content=\"{date}\">\
         <meta name=\"modified\" content=\"{modified}\">\
         <meta name=\"tags\" content=\"{tags}\">\
         <meta name=\"authors\" content=\"{authors}\">\
         </head><body>{body}</body></html>",
        title = encode_text(&document.title),
        date = encode_double_quoted_attribute(&document.history.created_date),
        modified = encode_double_quoted_attribute(&document.version.when),
        tags = encode_double_quoted_attribute(&tags),
        authors = encode_double_quoted_attribute(document.author()),
    )
}
