//! Rich-content documents
//!
//! Entity content is stored in the editor's node-tree format: a `doc` root
//! whose children are block nodes (`paragraph`, `heading`, lists) that end
//! in `text` leaves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error converting raw content into a document
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// Content is a JSON type that cannot hold a document
    #[error("unsupported content type: {0}")]
    Unsupported(&'static str),

    /// Content looked like a node tree but did not parse
    #[error("malformed rich content: {0}")]
    Malformed(String),
}

/// One node of a rich-content tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichNode {
    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<RichNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Value>,
}

impl RichNode {
    /// A text leaf
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            node_type: "text".to_string(),
            attrs: None,
            content: Vec::new(),
            text: Some(text.into()),
            marks: Vec::new(),
        }
    }

    /// A paragraph holding one text leaf
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::block("paragraph", vec![Self::text(text)])
    }

    /// A container node
    pub fn block(node_type: impl Into<String>, content: Vec<RichNode>) -> Self {
        Self {
            node_type: node_type.into(),
            attrs: None,
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    fn collect_text<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.node_type == "text" {
            if let Some(text) = self.text.as_deref() {
                out.push(text);
            }
            return;
        }
        for child in &self.content {
            child.collect_text(out);
        }
    }
}

/// A complete rich-content document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RichDocument {
    root: RichNode,
}

impl RichDocument {
    /// Wrap block nodes in a `doc` root
    pub fn from_nodes(nodes: Vec<RichNode>) -> Self {
        Self {
            root: RichNode::block("doc", nodes),
        }
    }

    /// One paragraph per non-empty line
    pub fn from_text(text: &str) -> Self {
        Self::from_nodes(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(RichNode::paragraph)
                .collect(),
        )
    }

    /// Top-level block nodes
    pub fn nodes(&self) -> &[RichNode] {
        &self.root.content
    }

    /// Text leaves joined with single spaces
    pub fn plain_text(&self) -> String {
        let mut leaves = Vec::new();
        self.root.collect_text(&mut leaves);
        leaves
            .into_iter()
            .map(str::trim)
            .filter(|leaf| !leaf.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Serialize to JSON
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Convert raw row content into a document
///
/// Strings become paragraphs, a `doc` object is taken as-is, any other node
/// or array of nodes is wrapped in a `doc` root.
pub fn to_rich_document(raw: &Value) -> Result<RichDocument, ContentError> {
    match raw {
        Value::String(text) => Ok(RichDocument::from_text(text)),
        Value::Object(object) => {
            let node: RichNode = serde_json::from_value(raw.clone())
                .map_err(|e| ContentError::Malformed(e.to_string()))?;
            if object.get("type").and_then(Value::as_str) == Some("doc") {
                Ok(RichDocument { root: node })
            } else {
                Ok(RichDocument::from_nodes(vec![node]))
            }
        }
        Value::Array(_) => {
            let nodes: Vec<RichNode> = serde_json::from_value(raw.clone())
                .map_err(|e| ContentError::Malformed(e.to_string()))?;
            Ok(RichDocument::from_nodes(nodes))
        }
        Value::Null => Err(ContentError::Unsupported("null")),
        Value::Bool(_) => Err(ContentError::Unsupported("boolean")),
        Value::Number(_) => Err(ContentError::Unsupported("number")),
    }
}
