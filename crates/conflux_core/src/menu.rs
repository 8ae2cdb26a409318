//! Navigation menu derived from the exported page tree.
//!
//! The site theme reads three structures from the per-export settings file:
//! the visible menu tree, a map from every page URL to the ID of the
//! top-level page it lives under, and a single-entry menu per top-level page.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::links::{ExportMapping, LinkStyle};
use crate::store::ContentRecord;

pub const LABEL_HIDDEN: &str = "hidden";
pub const LABEL_MENU: &str = "menu";
pub const TOP_LEVEL: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuNode {
    pub title: String,
    pub url: String,
    pub children: Vec<MenuNode>,
}

// The theme expects `[title, url, [children...]]`.
impl Serialize for MenuNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.title, &self.url, &self.children).serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MenuOutput {
    #[serde(rename = "MENU_HIERARCHY")]
    pub menu: Vec<MenuNode>,
    #[serde(rename = "HIERARCHY_MENU_MAP")]
    pub section_map: BTreeMap<String, String>,
    #[serde(rename = "HIERARCHY_MENUS")]
    pub section_menus: BTreeMap<String, Vec<MenuNode>>,
}

pub fn is_visible(record: &ContentRecord) -> bool {
    let labelled = |name: &str| record.labels.iter().any(|label| label == name);
    !labelled(LABEL_HIDDEN) && (labelled(LABEL_MENU) || record.level.unwrap_or(0) > TOP_LEVEL)
}

pub struct MenuBuilder<'a> {
    mapping: &'a ExportMapping,
    style: LinkStyle,
    children: BTreeMap<&'a str, Vec<&'a ContentRecord>>,
    top_level: Vec<&'a ContentRecord>,
}

impl<'a> MenuBuilder<'a> {
    /// `pages` must be in export order; siblings keep that order in the menu.
    pub fn new<I>(pages: I, mapping: &'a ExportMapping, style: LinkStyle) -> Self
    where
        I: IntoIterator<Item = &'a ContentRecord>,
    {
        let mut children: BTreeMap<&str, Vec<&ContentRecord>> = BTreeMap::new();
        let mut top_level = Vec::new();
        for page in pages {
            if page.level == Some(TOP_LEVEL) {
                top_level.push(page);
            }
            if let Some(parent_id) = page.parent_id.as_deref() {
                children.entry(parent_id).or_default().push(page);
            }
        }
        Self {
            mapping,
            style,
            children,
            top_level,
        }
    }

    pub fn build(&self) -> MenuOutput {
        let mut output = MenuOutput::default();
        let mut visited = BTreeSet::new();
        for &page in &self.top_level {
            if let Some(node) = self.visit(page, &page.id, &mut output, &mut visited) {
                output.menu.push(node);
            }
        }
        output
    }

    fn visit(
        &self,
        page: &'a ContentRecord,
        section: &str,
        output: &mut MenuOutput,
        visited: &mut BTreeSet<&'a str>,
    ) -> Option<MenuNode> {
        if !visited.insert(page.id.as_str()) {
            return None;
        }
        let Some(path) = self.mapping.get(&page.id) else {
            debug!(id = %page.id, "page has no export path; left out of the menu");
            return None;
        };
        let url = self.style.page_url(path);

        let children = self
            .children
            .get(page.id.as_str())
            .map(|children| {
                children
                    .iter()
                    .copied()
                    .filter_map(|child| self.visit(child, section, output, visited))
                    .collect()
            })
            .unwrap_or_default();
        let node = MenuNode {
            title: page.title.clone(),
            url: url.clone(),
            children,
        };

        output.section_map.insert(url, section.to_string());
        if page.level == Some(TOP_LEVEL) {
            output
                .section_menus
                .insert(section.to_string(), vec![node.clone()]);
        }
        is_visible(page).then_some(node)
    }
}
