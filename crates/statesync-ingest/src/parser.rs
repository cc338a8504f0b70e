//! Status document parser
//!
//! A status document is any root element whose children are `<Module>` or
//! `<DeviceStatus>` record nodes:
//!
//! ```xml
//! <Modules>
//!   <Module>
//!     <ModuleCategoryID>M1</ModuleCategoryID>
//!     <ModuleState>Online</ModuleState>
//!   </Module>
//!   <DeviceStatus>
//!     <ModuleCategoryID>M2</ModuleCategoryID>
//!   </DeviceStatus>
//! </Modules>
//! ```
//!
//! `<ModuleCategoryID>` is required and must not be blank. `<ModuleState>` is
//! optional; the scanner's state policy decides what a missing state becomes.
//! Unknown children of a record node are ignored, but anything else directly
//! under the root (another element, or text) fails the document. Attributes
//! on the root are allowed.

use serde::de::{Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;

use statesync_common::ModuleState;

use crate::error::ParseError;

const RECORD_NODES: [&str; 2] = ["Module", "DeviceStatus"];

/// Document root; the root element's own name is not checked
#[derive(Debug, Default)]
struct StatusDocument {
    /// Record nodes in document order
    nodes: Vec<RawNode>,
    /// Root content that is not a record node
    unexpected: Vec<String>,
}

impl<'de> Deserialize<'de> for StatusDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(DocumentVisitor)
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = StatusDocument;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a root element of <Module> and <DeviceStatus> nodes")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut document = StatusDocument::default();

        while let Some(key) = map.next_key::<String>()? {
            if RECORD_NODES.contains(&key.as_str()) {
                document.nodes.push(map.next_value()?);
                continue;
            }

            map.next_value::<IgnoredAny>()?;
            match key.as_str() {
                // Root attributes
                attribute if attribute.starts_with('@') => {}
                "$text" | "$value" => document.unexpected.push("text content".to_string()),
                element => document.unexpected.push(format!("<{element}>")),
            }
        }

        Ok(document)
    }
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(rename = "ModuleCategoryID", default)]
    category_key: Option<String>,
    #[serde(rename = "ModuleState", default)]
    state: Option<String>,
}

/// One record node, validated but without a state policy applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNode {
    pub category_key: String,
    /// State reported by the document, if any
    pub state: Option<ModuleState>,
}

/// Parse a status document into its record nodes, in document order.
///
/// A document with no content at all yields no nodes.
pub fn parse_status_document(content: &str) -> Result<Vec<StatusNode>, ParseError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let document: StatusDocument = quick_xml::de::from_str(content)?;

    if !document.unexpected.is_empty() {
        return Err(ParseError::UnexpectedContent {
            found: document.unexpected,
        });
    }

    document
        .nodes
        .into_iter()
        .enumerate()
        .map(|(node, raw)| validate_node(node, raw))
        .collect()
}

fn validate_node(node: usize, raw: RawNode) -> Result<StatusNode, ParseError> {
    let category_key = raw
        .category_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or(ParseError::MissingField {
            node,
            field: "ModuleCategoryID",
        })?;

    let state = match raw.state.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(value.parse::<ModuleState>().map_err(|e| {
            ParseError::InvalidField {
                node,
                field: "ModuleState",
                reason: e.to_string(),
            }
        })?),
    };

    Ok(StatusNode {
        category_key,
        state,
    })
}
