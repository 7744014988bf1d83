//! Side-channel tag parsing for backends that interleave auxiliary text
//! (commentary, analysis, thinking) with the visible answer.

use std::collections::BTreeMap;

use agentflow_llm::Content;
use serde::{Deserialize, Serialize};

/// Channel the think wrapper collects under
pub const THINK_CHANNEL: &str = "think";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelTags {
    pub channel_start: String,
    pub message_start: String,
    pub segment_end: String,
    pub think_start: String,
    pub think_end: String,
}

impl Default for ChannelTags {
    fn default() -> Self {
        Self {
            channel_start: "<|channel|>".to_string(),
            message_start: "<|message|>".to_string(),
            segment_end: "<|end|>".to_string(),
            think_start: "<think>".to_string(),
            think_end: "</think>".to_string(),
        }
    }
}

impl ChannelTags {
    /// Custom channel tags; the think wrapper keeps its defaults
    pub fn new(
        channel_start: impl Into<String>,
        message_start: impl Into<String>,
        segment_end: impl Into<String>,
    ) -> Self {
        Self {
            channel_start: channel_start.into(),
            message_start: message_start.into(),
            segment_end: segment_end.into(),
            ..Self::default()
        }
    }

    pub fn with_think(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.think_start = start.into();
        self.think_end = end.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelParse {
    /// Visible text left after the last complete segment
    pub content: String,
    pub channels: BTreeMap<String, String>,
}

impl ChannelParse {
    pub fn is_tagged(&self) -> bool {
        !self.channels.is_empty()
    }
}

enum Segment<'a> {
    Channel { name: &'a str, text: &'a str, rest: &'a str },
    Think { text: &'a str, rest: &'a str },
}

/// Split tagged segments out of `content`.
///
/// Parsing stops at the first segment that is not properly terminated; that
/// text and everything after it stays visible.
pub fn parse_channel_metadata(content: &str, tags: &ChannelTags) -> ChannelParse {
    let mut channels: BTreeMap<String, String> = BTreeMap::new();
    let mut rest = content;

    while let Some(segment) = next_segment(rest, tags) {
        let (name, text, remaining) = match segment {
            Segment::Channel { name, text, rest } => (name, text, rest),
            Segment::Think { text, rest } => (THINK_CHANNEL, text, rest),
        };
        channels.entry(name.to_string()).or_default().push_str(text);
        rest = remaining;
    }

    if channels.is_empty() {
        return ChannelParse {
            content: content.to_string(),
            channels,
        };
    }

    ChannelParse {
        content: rest.to_string(),
        channels,
    }
}

/// Content-level wrapper: non-text content passes through untouched
pub fn parse_content_channels(content: &Content, tags: &ChannelTags) -> Option<ChannelParse> {
    content
        .as_text()
        .map(|text| parse_channel_metadata(text, tags))
        .filter(ChannelParse::is_tagged)
}

fn next_segment<'a>(text: &'a str, tags: &ChannelTags) -> Option<Segment<'a>> {
    let channel_at = find_tag(text, &tags.channel_start);
    let think_at = find_tag(text, &tags.think_start);

    match (channel_at, think_at) {
        (Some(c), Some(t)) if t < c => think_segment(&text[t..], tags),
        (Some(c), _) => channel_segment(&text[c..], tags),
        (None, Some(t)) => think_segment(&text[t..], tags),
        (None, None) => None,
    }
}

fn find_tag(text: &str, tag: &str) -> Option<usize> {
    if tag.is_empty() {
        return None;
    }
    text.find(tag)
}

fn channel_segment<'a>(text: &'a str, tags: &ChannelTags) -> Option<Segment<'a>> {
    let after_start = &text[tags.channel_start.len()..];
    let message_at = find_tag(after_start, &tags.message_start)?;
    let name = after_start[..message_at].trim();

    let body = &after_start[message_at + tags.message_start.len()..];
    let end_at = find_tag(body, &tags.segment_end)?;

    Some(Segment::Channel {
        name,
        text: &body[..end_at],
        rest: &body[end_at + tags.segment_end.len()..],
    })
}

fn think_segment<'a>(text: &'a str, tags: &ChannelTags) -> Option<Segment<'a>> {
    let body = &text[tags.think_start.len()..];
    let end_at = find_tag(body, &tags.think_end)?;

    Some(Segment::Think {
        text: &body[..end_at],
        rest: &body[end_at + tags.think_end.len()..],
    })
}
