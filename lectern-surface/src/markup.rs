//! Flattens chapter markup into plain-text blocks.
//!
//! Chapter text is the block texts joined with `\n`; every offset in this
//! module is a character offset into that text.

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkupError {
    #[error("malformed chapter markup: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub id: Option<String>,
    pub start: usize,
    pub text: String,
    pub len: usize,
}

impl TextBlock {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedChapter {
    pub title: Option<String>,
    pub blocks: Vec<TextBlock>,
    /// Fragment ids and the offset they point at.
    pub anchors: Vec<(String, usize)>,
}

impl ParsedChapter {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn char_len(&self) -> usize {
        self.blocks.last().map_or(0, TextBlock::end)
    }

    /// Block containing `offset`; the separator after a block belongs to it.
    pub fn block_at(&self, offset: usize) -> Option<(usize, &TextBlock)> {
        let index = self
            .blocks
            .partition_point(|block| block.start <= offset)
            .checked_sub(1)?;
        Some((index, &self.blocks[index]))
    }

    pub fn anchor(&self, id: &str) -> Option<usize> {
        self.anchors
            .iter()
            .find(|(anchor, _)| anchor == id)
            .map(|(_, offset)| (*offset).min(self.char_len()))
    }
}

const BLOCK_TAGS: &[&[u8]] = &[
    b"p", b"div", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"li", b"blockquote", b"pre",
    b"section", b"article", b"aside", b"header", b"footer", b"figure", b"figcaption", b"dt",
    b"dd", b"tr", b"td", b"th", b"body",
];

const SKIPPED_TAGS: &[&[u8]] = &[b"head", b"script", b"style", b"svg"];

/// Parses XHTML chapter markup, or plain text split on blank lines when the
/// input does not start with a tag.
pub fn parse_chapter(markup: &str) -> Result<ParsedChapter, MarkupError> {
    if markup.trim_start().starts_with('<') {
        parse_xhtml(markup)
    } else {
        Ok(parse_plain(markup))
    }
}

fn parse_plain(text: &str) -> ParsedChapter {
    let mut builder = BlockBuilder::default();
    for line in text.lines() {
        if line.trim().is_empty() {
            builder.flush();
        } else {
            builder.push_text(line);
            builder.push_text(" ");
        }
    }
    builder.finish(None)
}

fn parse_xhtml(markup: &str) -> Result<ParsedChapter, MarkupError> {
    let mut reader = Reader::from_str(markup);
    reader.config_mut().trim_text(false);

    let mut builder = BlockBuilder::default();
    let mut skip_depth = 0usize;
    let mut in_title = false;
    let mut title = String::new();

    loop {
        let event = reader.read_event().map_err(|err| {
            MarkupError::Malformed(format!("{err} at byte {}", reader.buffer_position()))
        })?;
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if name == b"title" {
                    in_title = true;
                }
                if SKIPPED_TAGS.contains(&name.as_slice()) {
                    skip_depth += 1;
                    continue;
                }
                if skip_depth > 0 {
                    continue;
                }
                if BLOCK_TAGS.contains(&name.as_slice()) {
                    builder.open_block(element_id(&e));
                } else if name == b"br" {
                    builder.flush();
                } else if let Some(id) = element_id(&e) {
                    builder.anchor(id);
                }
            }
            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if name == b"br" || name == b"hr" {
                    builder.flush();
                }
                if let Some(id) = element_id(&e) {
                    builder.anchor(id);
                }
            }
            Event::End(e) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if name == b"title" {
                    in_title = false;
                }
                if SKIPPED_TAGS.contains(&name.as_slice()) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if skip_depth == 0 && BLOCK_TAGS.contains(&name.as_slice()) {
                    builder.flush();
                }
            }
            Event::Text(e) => {
                let text = decode_text(&e);
                if in_title {
                    title.push_str(&text);
                } else if skip_depth == 0 {
                    builder.push_text(&text);
                }
            }
            Event::CData(e) => {
                if skip_depth == 0 {
                    builder.push_text(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(builder.finish(Some(title).filter(|t| !t.is_empty())))
}

fn element_id(element: &BytesStart<'_>) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"id")
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn decode_text(text: &BytesText<'_>) -> String {
    match text.unescape_with(resolve_entity) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

fn resolve_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "nbsp" => "\u{a0}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "copy" => "\u{a9}",
        _ => return resolve_predefined_entity(name),
    })
}

#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<TextBlock>,
    anchors: Vec<(String, usize)>,
    current: String,
    current_len: usize,
    current_id: Option<String>,
    pending_space: bool,
    offset: usize,
}

impl BlockBuilder {
    fn push_text(&mut self, text: &str) {
        for ch in text.chars() {
            if ch.is_whitespace() {
                self.pending_space = self.current_len > 0;
                continue;
            }
            if self.pending_space {
                self.current.push(' ');
                self.current_len += 1;
                self.pending_space = false;
            }
            self.current.push(ch);
            self.current_len += 1;
        }
    }

    fn open_block(&mut self, id: Option<String>) {
        self.flush();
        self.current_id = id;
    }

    fn anchor(&mut self, id: String) {
        let position = self.offset + self.current_len + usize::from(self.pending_space);
        self.anchors.push((id, position));
    }

    fn flush(&mut self) {
        self.pending_space = false;
        let id = self.current_id.take();
        if self.current_len == 0 {
            // an empty element with an id still marks where the next block starts
            if let Some(id) = id {
                self.anchors.push((id, self.offset));
            }
            return;
        }
        if let Some(id) = &id {
            self.anchors.push((id.clone(), self.offset));
        }
        let text = std::mem::take(&mut self.current);
        let len = std::mem::take(&mut self.current_len);
        self.blocks.push(TextBlock {
            id,
            start: self.offset,
            text,
            len,
        });
        self.offset += len + 1;
    }

    fn finish(mut self, title: Option<String>) -> ParsedChapter {
        self.flush();
        ParsedChapter {
            title,
            blocks: self.blocks,
            anchors: self.anchors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAPTER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
  <head>
    <title>Chapter  One</title>
    <style>p { margin: 0 }</style>
  </head>
  <body>
    <h1 id="start">Chapter One</h1>
    <p>It was a   bright
       cold day in <em>April</em>.</p>
    <p id="p2">Fish &amp; chips&nbsp;for <a id="note">tea</a>.</p>
  </body>
</html>"#;

    #[test]
    fn xhtml_blocks_collapse_whitespace() {
        let parsed = parse_chapter(CHAPTER).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Chapter One"));
        let texts: Vec<_> = parsed.blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Chapter One",
                "It was a bright cold day in April.",
                "Fish & chips for tea.",
            ]
        );
        assert_eq!(
            parsed.text(),
            "Chapter One\nIt was a bright cold day in April.\nFish & chips for tea."
        );
        assert_eq!(parsed.char_len(), parsed.text().chars().count());
    }

    #[test]
    fn ids_become_anchors() {
        let parsed = parse_chapter(CHAPTER).unwrap();
        assert_eq!(parsed.anchor("start"), Some(0));
        let p2 = &parsed.blocks[2];
        assert_eq!(p2.id.as_deref(), Some("p2"));
        assert_eq!(parsed.anchor("p2"), Some(p2.start));
        // "tea" starts after "Fish & chips for "
        assert_eq!(parsed.anchor("note"), Some(p2.start + 17));
        assert_eq!(parsed.anchor("missing"), None);
    }

    #[test]
    fn block_lookup_includes_separator() {
        let parsed = parse_chapter(CHAPTER).unwrap();
        let first = &parsed.blocks[0];
        assert_eq!(parsed.block_at(0).map(|(i, _)| i), Some(0));
        assert_eq!(parsed.block_at(first.end()).map(|(i, _)| i), Some(0));
        assert_eq!(parsed.block_at(first.end() + 1).map(|(i, _)| i), Some(1));
    }

    #[test]
    fn line_breaks_split_blocks() {
        let parsed = parse_chapter("<body><p>one<br/>two</p><div><p>three</p></div></body>").unwrap();
        let texts: Vec<_> = parsed.blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn plain_text_splits_on_blank_lines() {
        let parsed = parse_chapter("First line\ncontinues here.\n\n\nSecond paragraph.\n").unwrap();
        let texts: Vec<_> = parsed.blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["First line continues here.", "Second paragraph."]);
        assert!(parsed.title.is_none());
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let err = parse_chapter("<html><body><p>one</div></body></html>").unwrap_err();
        assert!(matches!(err, MarkupError::Malformed(_)));
    }
}
