// Node splice protocol: replaces a placeholder anchor with parsed content.
//
// `splice` computes edit operations against a document tree without
// mutating it; `apply_ops` materializes them. Both are pure so the
// protocol can be tested with no transport or persistence in sight.

use thiserror::Error;
use uuid::Uuid;

use crate::markdown::MarkdownError;
use crate::node::{BlockNode, InlineNode, ListItem};

/// An edit produced by the splice protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOp {
    /// Replace an inline placeholder with inline content, in place.
    SpliceInline { block_id: Uuid, index: usize, content: Vec<InlineNode> },
    /// Split the anchor's parent at the anchor and insert blocks between the
    /// halves; the anchor is removed.
    SplitBlock { block_id: Uuid, index: usize, insert: Vec<BlockNode> },
    /// Replace a block-position placeholder with a run of blocks.
    ReplaceBlock { block_id: Uuid, insert: Vec<BlockNode> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpliceError {
    /// The anchor was deleted out from under the query (e.g. by another
    /// editor). Callers must report the conflict, not re-insert elsewhere.
    #[error("anchor node {anchor_id} no longer exists in the document")]
    AnchorNotFound { anchor_id: Uuid },
    #[error("generated content could not be parsed: {0}")]
    ContentUnparsable(#[from] MarkdownError),
}

/// Where the anchor was found.
enum AnchorSite {
    /// Inline placeholder at `children[index]` of a paragraph-like block.
    Inline { block_id: Uuid, index: usize },
    /// The block itself is the placeholder.
    Block { block_id: Uuid },
}

/// Compute the edit operations that replace `anchor_id` with `parsed`.
pub fn splice(
    tree: &[BlockNode],
    anchor_id: Uuid,
    parsed: &[BlockNode],
) -> Result<Vec<EditOp>, SpliceError> {
    if parsed.is_empty() {
        return Err(SpliceError::ContentUnparsable(MarkdownError::Empty));
    }

    let site = find_anchor(tree, anchor_id)
        .ok_or(SpliceError::AnchorNotFound { anchor_id })?;

    let op = match site {
        AnchorSite::Inline { block_id, index } => match parsed {
            // A single inline-only paragraph splices in place without
            // introducing a block boundary.
            [BlockNode::Paragraph { children, .. }] => {
                EditOp::SpliceInline { block_id, index, content: children.clone() }
            }
            _ => EditOp::SplitBlock { block_id, index, insert: parsed.to_vec() },
        },
        AnchorSite::Block { block_id } => {
            EditOp::ReplaceBlock { block_id, insert: parsed.to_vec() }
        }
    };

    Ok(vec![op])
}

/// Apply edit operations to a tree, yielding the transformed tree.
pub fn apply_ops(tree: Vec<BlockNode>, ops: &[EditOp]) -> Vec<BlockNode> {
    ops.iter().fold(tree, |blocks, op| {
        blocks.into_iter().flat_map(|block| transform_block(block, op)).collect()
    })
}

fn find_anchor(tree: &[BlockNode], anchor_id: Uuid) -> Option<AnchorSite> {
    for block in tree {
        match block {
            BlockNode::Placeholder { id } if *id == anchor_id => {
                return Some(AnchorSite::Block { block_id: *id });
            }
            BlockNode::Paragraph { id, children } | BlockNode::Heading { id, children, .. } => {
                if let Some(index) = children
                    .iter()
                    .position(|node| matches!(node, InlineNode::Placeholder { id } if *id == anchor_id))
                {
                    return Some(AnchorSite::Inline { block_id: *id, index });
                }
            }
            BlockNode::Blockquote { children, .. } => {
                if let Some(site) = find_anchor(children, anchor_id) {
                    return Some(site);
                }
            }
            BlockNode::List { items, .. } => {
                for item in items {
                    if let Some(site) = find_anchor(&item.blocks, anchor_id) {
                        return Some(site);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn transform_block(block: BlockNode, op: &EditOp) -> Vec<BlockNode> {
    match op {
        EditOp::SpliceInline { block_id, index, content } if block.id() == *block_id => {
            vec![splice_inline(block, *index, content)]
        }
        EditOp::SplitBlock { block_id, index, insert } if block.id() == *block_id => {
            split_block(block, *index, insert)
        }
        EditOp::ReplaceBlock { block_id, insert } if block.id() == *block_id => insert.clone(),
        _ => vec![recurse(block, op)],
    }
}

fn recurse(block: BlockNode, op: &EditOp) -> BlockNode {
    match block {
        BlockNode::Blockquote { id, children } => BlockNode::Blockquote {
            id,
            children: children.into_iter().flat_map(|child| transform_block(child, op)).collect(),
        },
        BlockNode::List { id, ordered, items } => BlockNode::List {
            id,
            ordered,
            items: items
                .into_iter()
                .map(|item| ListItem {
                    blocks: item
                        .blocks
                        .into_iter()
                        .flat_map(|child| transform_block(child, op))
                        .collect(),
                })
                .collect(),
        },
        other => other,
    }
}

fn splice_inline(block: BlockNode, index: usize, content: &[InlineNode]) -> BlockNode {
    match block {
        BlockNode::Paragraph { id, mut children } => {
            children.splice(index..index + 1, content.iter().cloned());
            BlockNode::Paragraph { id, children }
        }
        BlockNode::Heading { id, level, mut children } => {
            children.splice(index..index + 1, content.iter().cloned());
            BlockNode::Heading { id, level, children }
        }
        other => other,
    }
}

fn split_block(block: BlockNode, index: usize, insert: &[BlockNode]) -> Vec<BlockNode> {
    let (before_half, after_half) = match block {
        BlockNode::Paragraph { id, mut children } => {
            let after: Vec<InlineNode> = children.split_off(index + 1);
            children.truncate(index);
            let before = (!children.is_empty())
                .then(|| BlockNode::Paragraph { id, children });
            (before, after)
        }
        BlockNode::Heading { id, level, mut children } => {
            let after: Vec<InlineNode> = children.split_off(index + 1);
            children.truncate(index);
            let before = (!children.is_empty())
                .then(|| BlockNode::Heading { id, level, children });
            (before, after)
        }
        other => return vec![other],
    };

    let mut result = Vec::with_capacity(insert.len() + 2);
    result.extend(before_half);
    result.extend(insert.iter().cloned());
    if !after_half.is_empty() {
        // The trailing half continues as a plain paragraph after the
        // inserted blocks.
        result.push(BlockNode::paragraph(after_half));
    }
    result
}
