// Markdown front-end: turns generated text into content nodes.
//
// Consumed as a black box by the query orchestrator — callers only see
// `parse_markdown(text) -> Vec<BlockNode> | MarkdownError`.

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Parser, Tag, TagEnd};
use thiserror::Error;
use uuid::Uuid;

use crate::node::{BlockNode, InlineNode, ListItem};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkdownError {
    #[error("generated content was empty")]
    Empty,
}

/// Parse markdown text into a run of block nodes.
pub fn parse_markdown(text: &str) -> Result<Vec<BlockNode>, MarkdownError> {
    if text.trim().is_empty() {
        return Err(MarkdownError::Empty);
    }

    let mut builder = TreeBuilder::new();
    for event in Parser::new(text) {
        builder.handle(event);
    }
    let blocks = builder.finish();

    if blocks.is_empty() {
        return Err(MarkdownError::Empty);
    }
    Ok(blocks)
}

enum Frame {
    Blocks { blocks: Vec<BlockNode> },
    List { ordered: bool, items: Vec<ListItem> },
}

enum Mark {
    Strong,
    Emphasis,
    Link { href: String },
}

struct TreeBuilder {
    frames: Vec<Frame>,
    inline: Vec<InlineNode>,
    marks: Vec<(Mark, Vec<InlineNode>)>,
    code: Option<CodeDraft>,
}

struct CodeDraft {
    language: Option<String>,
    text: String,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            frames: vec![Frame::Blocks { blocks: Vec::new() }],
            inline: Vec::new(),
            marks: Vec::new(),
            code: None,
        }
    }

    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(Tag::Paragraph) => self.flush_implicit_paragraph(),
            Event::End(TagEnd::Paragraph) => {
                let children = std::mem::take(&mut self.inline);
                self.push_block(BlockNode::Paragraph { id: Uuid::new_v4(), children });
            }
            Event::Start(Tag::Heading { .. }) => self.flush_implicit_paragraph(),
            Event::End(TagEnd::Heading(level)) => {
                let children = std::mem::take(&mut self.inline);
                self.push_block(BlockNode::Heading {
                    id: Uuid::new_v4(),
                    level: level_to_u8(level),
                    children,
                });
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                self.flush_implicit_paragraph();
                let language = match kind {
                    CodeBlockKind::Fenced(info) if !info.is_empty() => Some(info.to_string()),
                    _ => None,
                };
                self.code = Some(CodeDraft { language, text: String::new() });
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(draft) = self.code.take() {
                    self.push_block(BlockNode::CodeBlock {
                        id: Uuid::new_v4(),
                        language: draft.language,
                        text: draft.text.trim_end_matches('\n').to_string(),
                    });
                }
            }
            Event::Start(Tag::List(start)) => {
                self.flush_implicit_paragraph();
                self.frames.push(Frame::List { ordered: start.is_some(), items: Vec::new() });
            }
            Event::End(TagEnd::List(_)) => {
                if let Some(Frame::List { ordered, items }) = self.frames.pop() {
                    self.push_block(BlockNode::List { id: Uuid::new_v4(), ordered, items });
                }
            }
            Event::Start(Tag::Item) => {
                self.frames.push(Frame::Blocks { blocks: Vec::new() });
            }
            Event::End(TagEnd::Item) => {
                self.flush_implicit_paragraph();
                if let Some(Frame::Blocks { blocks }) = self.frames.pop() {
                    if let Some(Frame::List { items, .. }) = self.frames.last_mut() {
                        items.push(ListItem { blocks });
                    }
                }
            }
            Event::Start(Tag::BlockQuote(_)) => {
                self.flush_implicit_paragraph();
                self.frames.push(Frame::Blocks { blocks: Vec::new() });
            }
            Event::End(TagEnd::BlockQuote(_)) => {
                self.flush_implicit_paragraph();
                if let Some(Frame::Blocks { blocks }) = self.frames.pop() {
                    self.push_block(BlockNode::Blockquote { id: Uuid::new_v4(), children: blocks });
                }
            }
            Event::Start(Tag::Strong) => self.push_mark(Mark::Strong),
            Event::End(TagEnd::Strong) => self.pop_mark(),
            Event::Start(Tag::Emphasis) => self.push_mark(Mark::Emphasis),
            Event::End(TagEnd::Emphasis) => self.pop_mark(),
            Event::Start(Tag::Link { dest_url, .. }) => {
                self.push_mark(Mark::Link { href: dest_url.to_string() });
            }
            Event::End(TagEnd::Link) => self.pop_mark(),
            Event::Text(text) => {
                if let Some(draft) = self.code.as_mut() {
                    draft.text.push_str(&text);
                } else {
                    self.inline.push(InlineNode::Text { text: text.to_string() });
                }
            }
            Event::Code(text) => {
                self.inline.push(InlineNode::Code { text: text.to_string() });
            }
            Event::SoftBreak => self.inline.push(InlineNode::text(" ")),
            Event::HardBreak => self.inline.push(InlineNode::text("\n")),
            // HTML, footnotes, tables, task markers and rules are outside the
            // splice model and are skipped.
            _ => {}
        }
    }

    fn finish(mut self) -> Vec<BlockNode> {
        self.flush_implicit_paragraph();
        match self.frames.pop() {
            Some(Frame::Blocks { blocks }) => blocks,
            _ => Vec::new(),
        }
    }

    fn push_mark(&mut self, mark: Mark) {
        let outer = std::mem::take(&mut self.inline);
        self.marks.push((mark, outer));
    }

    fn pop_mark(&mut self) {
        let Some((mark, outer)) = self.marks.pop() else {
            return;
        };
        let children = std::mem::replace(&mut self.inline, outer);
        let node = match mark {
            Mark::Strong => InlineNode::Strong { children },
            Mark::Emphasis => InlineNode::Emphasis { children },
            Mark::Link { href } => InlineNode::Link { href, children },
        };
        self.inline.push(node);
    }

    /// Tight list items carry bare text with no paragraph events; wrap any
    /// accumulated inline content before a block boundary.
    fn flush_implicit_paragraph(&mut self) {
        if self.inline.is_empty() {
            return;
        }
        let children = std::mem::take(&mut self.inline);
        self.push_block(BlockNode::Paragraph { id: Uuid::new_v4(), children });
    }

    fn push_block(&mut self, block: BlockNode) {
        if let Some(Frame::Blocks { blocks }) = self.frames.last_mut() {
            blocks.push(block);
        }
    }
}

fn level_to_u8(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tree_plain_text;

    #[test]
    fn plain_sentence_becomes_single_paragraph() {
        let blocks = parse_markdown("Hello world").unwrap();
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            BlockNode::Paragraph { children, .. } => {
                assert_eq!(children, &vec![InlineNode::text("Hello world")]);
            }
            other => panic!("expected paragraph, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(parse_markdown(""), Err(MarkdownError::Empty));
        assert_eq!(parse_markdown("   \n\t"), Err(MarkdownError::Empty));
    }

    #[test]
    fn heading_levels_map_through() {
        let blocks = parse_markdown("## Section\n\nBody text.").unwrap();
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            BlockNode::Heading { level, children, .. } => {
                assert_eq!(*level, 2);
                assert_eq!(children, &vec![InlineNode::text("Section")]);
            }
            other => panic!("expected heading, got {other:?}"),
        }
    }

    #[test]
    fn inline_marks_nest() {
        let blocks = parse_markdown("a **bold _both_** end").unwrap();
        match &blocks[0] {
            BlockNode::Paragraph { children, .. } => {
                assert_eq!(children.len(), 3);
                match &children[1] {
                    InlineNode::Strong { children } => {
                        assert_eq!(children[0], InlineNode::text("bold "));
                        assert_eq!(
                            children[1],
                            InlineNode::Emphasis { children: vec![InlineNode::text("both")] }
                        );
                    }
                    other => panic!("expected strong, got {other:?}"),
                }
            }
            other => panic!("expected paragraph, got {other:?}"),
        }
    }

    #[test]
    fn fenced_code_block_keeps_language() {
        let blocks = parse_markdown("```rust\nfn main() {}\n```").unwrap();
        match &blocks[0] {
            BlockNode::CodeBlock { language, text, .. } => {
                assert_eq!(language.as_deref(), Some("rust"));
                assert_eq!(text, "fn main() {}");
            }
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn tight_list_items_become_paragraph_wrapped_items() {
        let blocks = parse_markdown("- one\n- two").unwrap();
        match &blocks[0] {
            BlockNode::List { ordered, items, .. } => {
                assert!(!ordered);
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].blocks[0].plain_text(), "one");
                assert_eq!(items[1].blocks[0].plain_text(), "two");
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn ordered_list_is_flagged() {
        let blocks = parse_markdown("1. first\n2. second").unwrap();
        match &blocks[0] {
            BlockNode::List { ordered, .. } => assert!(ordered),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn blockquote_nests_blocks() {
        let blocks = parse_markdown("> quoted line").unwrap();
        match &blocks[0] {
            BlockNode::Blockquote { children, .. } => {
                assert_eq!(children.len(), 1);
                assert_eq!(children[0].plain_text(), "quoted line");
            }
            other => panic!("expected blockquote, got {other:?}"),
        }
    }

    #[test]
    fn inline_code_and_links_survive() {
        let blocks = parse_markdown("see `config.rs` at [docs](https://example.com)").unwrap();
        match &blocks[0] {
            BlockNode::Paragraph { children, .. } => {
                assert!(children.contains(&InlineNode::Code { text: "config.rs".to_string() }));
                assert!(children.iter().any(|node| matches!(
                    node,
                    InlineNode::Link { href, .. } if href == "https://example.com"
                )));
            }
            other => panic!("expected paragraph, got {other:?}"),
        }
    }

    #[test]
    fn soft_breaks_keep_text_contiguous() {
        let blocks = parse_markdown("line one\nline two").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(tree_plain_text(&blocks), "line one line two");
    }

    #[test]
    fn mixed_document_parses_in_order() {
        let blocks = parse_markdown("# Title\n\nIntro.\n\n```sh\nls\n```\n\n- a\n- b").unwrap();
        assert_eq!(blocks.len(), 4);
        assert!(matches!(blocks[0], BlockNode::Heading { .. }));
        assert!(matches!(blocks[1], BlockNode::Paragraph { .. }));
        assert!(matches!(blocks[2], BlockNode::CodeBlock { .. }));
        assert!(matches!(blocks[3], BlockNode::List { .. }));
    }
}
