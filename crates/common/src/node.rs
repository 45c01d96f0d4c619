// Content node model shared between the server and the editor protocol.
//
// The document body is a flat list of block nodes; paragraph-like blocks
// carry inline children. Placeholders mark the anchor where a streaming
// AI response will eventually be spliced in — they exist in both the
// inline and the block position.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A block-level node in the document tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockNode {
    Paragraph {
        id: Uuid,
        children: Vec<InlineNode>,
    },
    Heading {
        id: Uuid,
        level: u8,
        children: Vec<InlineNode>,
    },
    CodeBlock {
        id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        text: String,
    },
    List {
        id: Uuid,
        ordered: bool,
        items: Vec<ListItem>,
    },
    Blockquote {
        id: Uuid,
        children: Vec<BlockNode>,
    },
    /// A block-position anchor awaiting generated content.
    Placeholder {
        id: Uuid,
    },
}

/// One list item: a nested run of blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListItem {
    pub blocks: Vec<BlockNode>,
}

/// An inline node inside a paragraph-like container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InlineNode {
    Text {
        text: String,
    },
    Code {
        text: String,
    },
    Strong {
        children: Vec<InlineNode>,
    },
    Emphasis {
        children: Vec<InlineNode>,
    },
    Link {
        href: String,
        children: Vec<InlineNode>,
    },
    /// An inline-position anchor awaiting generated content.
    Placeholder {
        id: Uuid,
    },
}

impl BlockNode {
    /// The node's own id.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Paragraph { id, .. }
            | Self::Heading { id, .. }
            | Self::CodeBlock { id, .. }
            | Self::List { id, .. }
            | Self::Blockquote { id, .. }
            | Self::Placeholder { id } => *id,
        }
    }

    /// Build a paragraph with a fresh id.
    pub fn paragraph(children: Vec<InlineNode>) -> Self {
        Self::Paragraph { id: Uuid::new_v4(), children }
    }

    /// Whether this block carries inline children (is "paragraph-like").
    pub fn is_inline_container(&self) -> bool {
        matches!(self, Self::Paragraph { .. } | Self::Heading { .. })
    }

    /// Flatten to plain text. Used by splice invariant checks and logs —
    /// not a rendering.
    pub fn plain_text(&self) -> String {
        match self {
            Self::Paragraph { children, .. } | Self::Heading { children, .. } => {
                inline_plain_text(children)
            }
            Self::CodeBlock { text, .. } => text.clone(),
            Self::List { items, .. } => items
                .iter()
                .flat_map(|item| item.blocks.iter())
                .map(BlockNode::plain_text)
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Blockquote { children, .. } => {
                children.iter().map(BlockNode::plain_text).collect::<Vec<_>>().join("\n")
            }
            Self::Placeholder { .. } => String::new(),
        }
    }
}

impl InlineNode {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn plain_text(&self) -> String {
        match self {
            Self::Text { text } | Self::Code { text } => text.clone(),
            Self::Strong { children } | Self::Emphasis { children } => inline_plain_text(children),
            Self::Link { children, .. } => inline_plain_text(children),
            Self::Placeholder { .. } => String::new(),
        }
    }
}

/// Flatten a run of inline nodes to plain text.
pub fn inline_plain_text(children: &[InlineNode]) -> String {
    children.iter().map(InlineNode::plain_text).collect()
}

/// Flatten a document tree to plain text, one line per leaf block.
pub fn tree_plain_text(tree: &[BlockNode]) -> String {
    tree.iter()
        .map(BlockNode::plain_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
