//! Conversation shaping applied between parent outputs and a backend call.

use std::collections::HashSet;

use agentflow_llm::{Content, ContentPart, Message};

pub const DEFAULT_JOIN_SEPARATOR: &str = "\n";

/// Merge parent outputs into one conversation.
///
/// All System messages are concatenated in order into a single System message
/// placed first; everything else keeps its relative order.
pub fn combine_inputs(messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
    combine_inputs_with(messages, DEFAULT_JOIN_SEPARATOR)
}

pub fn combine_inputs_with(messages: impl IntoIterator<Item = Message>, separator: &str) -> Vec<Message> {
    let mut system: Vec<Content> = Vec::new();
    let mut rest = Vec::new();

    for message in messages {
        match message {
            Message::System { content, .. } => system.push(content),
            other => rest.push(other),
        }
    }

    if system.is_empty() {
        return rest;
    }

    let mut combined = Vec::with_capacity(rest.len() + 1);
    combined.push(Message::system(join_contents(system, separator)));
    combined.extend(rest);
    combined
}

fn join_contents(contents: Vec<Content>, separator: &str) -> Content {
    if contents.len() == 1 {
        return contents.into_iter().next().unwrap_or_else(|| Content::text(""));
    }

    if contents.iter().all(|c| matches!(c, Content::Text(_))) {
        let texts: Vec<String> = contents
            .into_iter()
            .filter_map(|c| match c {
                Content::Text(text) => Some(text),
                Content::Parts(_) => None,
            })
            .collect();
        return Content::Text(texts.join(separator));
    }

    let mut parts = Vec::new();
    for (i, content) in contents.into_iter().enumerate() {
        if i > 0 {
            parts.push(ContentPart::Text {
                text: separator.to_string(),
            });
        }
        match content {
            Content::Text(text) => parts.push(ContentPart::Text { text }),
            Content::Parts(more) => parts.extend(more),
        }
    }
    Content::Parts(parts)
}

/// Rewrite tool traffic for a backend without tool calling.
///
/// Identity when `tool_calling` is set.
pub fn sanitize_for_model(messages: Vec<Message>, tool_calling: bool) -> Vec<Message> {
    if tool_calling {
        return messages;
    }

    messages
        .into_iter()
        .filter_map(|message| match message {
            Message::ToolResult { content, .. } => Some(Message::Human { content, name: None }),
            Message::Assistant {
                content,
                tool_calls,
                name,
            } => {
                let has_content = content.as_ref().is_some_and(|c| !c.is_empty());
                if !has_content && !tool_calls.is_empty() {
                    return None;
                }
                Some(Message::Assistant {
                    content,
                    tool_calls: Vec::new(),
                    name,
                })
            }
            other => Some(other),
        })
        .collect()
}

/// Drop tool results nobody asked for and tool calls nobody answered.
pub fn reorder_and_filter_tool_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut issued: HashSet<&str> = HashSet::new();
    let mut answered: HashSet<&str> = HashSet::new();
    let mut kept_results: HashSet<usize> = HashSet::new();

    for (i, message) in messages.iter().enumerate() {
        match message {
            Message::Assistant { tool_calls, .. } => {
                issued.extend(tool_calls.iter().map(|c| c.id.as_str()));
            }
            Message::ToolResult { call_id, .. } if issued.contains(call_id.as_str()) => {
                answered.insert(call_id.as_str());
                kept_results.insert(i);
            }
            _ => {}
        }
    }

    let answered: HashSet<String> = answered.into_iter().map(str::to_string).collect();

    messages
        .into_iter()
        .enumerate()
        .filter_map(|(i, message)| match message {
            Message::ToolResult { .. } if !kept_results.contains(&i) => None,
            Message::Assistant {
                content,
                tool_calls,
                name,
            } if !tool_calls.is_empty() => {
                let tool_calls: Vec<_> = tool_calls
                    .into_iter()
                    .filter(|c| answered.contains(&c.id))
                    .collect();
                let has_content = content.as_ref().is_some_and(|c| !c.is_empty());
                (has_content || !tool_calls.is_empty()).then_some(Message::Assistant {
                    content,
                    tool_calls,
                    name,
                })
            }
            other => Some(other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_llm::ToolCall;

    #[test]
    fn test_systems_merge_in_front() {
        let merged = combine_inputs(vec![
            Message::human("hi"),
            Message::system("be terse"),
            Message::system("reply in English"),
        ]);
        assert_eq!(
            merged,
            vec![Message::system("be terse\nreply in English"), Message::human("hi")]
        );
    }

    #[test]
    fn test_no_adjacent_systems_survive() {
        let merged = combine_inputs(vec![
            Message::system("a"),
            Message::human("q1"),
            Message::system("b"),
            Message::assistant("r1"),
        ]);
        assert_eq!(merged.len(), 3);
        assert!(merged.windows(2).all(|w| !(w[0].is_system() && w[1].is_system())));
        assert_eq!(merged[0].text(), Some("a\nb"));
    }

    #[test]
    fn test_custom_separator() {
        let merged = combine_inputs_with(vec![Message::system("a"), Message::system("b")], "\n\n");
        assert_eq!(merged, vec![Message::system("a\n\nb")]);
    }

    #[test]
    fn test_multipart_system_content_is_kept() {
        let image = Content::Parts(vec![ContentPart::ImageUrl {
            image_url: agentflow_llm::types::ImageUrl {
                url: "https://example.com/a.png".to_string(),
            },
        }]);
        let merged = combine_inputs(vec![Message::system("look"), Message::system(image)]);
        match &merged[0] {
            Message::System { content: Content::Parts(parts), .. } => assert_eq!(parts.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sanitize_rewrites_tool_traffic() {
        let call = ToolCall::new("c1", "lookup", "{}");
        let input = vec![
            Message::human("q"),
            Message::assistant_with_tools(vec![call.clone()]),
            Message::tool_result("c1", "42"),
            Message::Assistant {
                content: Some(Content::text("the answer is 42")),
                tool_calls: vec![call],
                name: None,
            },
        ];

        let out = sanitize_for_model(input.clone(), false);
        assert_eq!(
            out,
            vec![
                Message::human("q"),
                Message::human("42"),
                Message::assistant("the answer is 42"),
            ]
        );

        assert_eq!(sanitize_for_model(input.clone(), true), input);
    }

    #[test]
    fn test_orphans_are_removed_in_order() {
        let input = vec![
            Message::tool_result("early", "before any call"),
            Message::human("q"),
            Message::assistant_with_tools(vec![
                ToolCall::new("a", "f", "{}"),
                ToolCall::new("b", "g", "{}"),
            ]),
            Message::tool_result("a", "ra"),
            Message::assistant_with_tools(vec![ToolCall::new("never", "h", "{}")]),
            Message::assistant("done"),
        ];

        let out = reorder_and_filter_tool_messages(input);
        assert_eq!(
            out,
            vec![
                Message::human("q"),
                Message::assistant_with_tools(vec![ToolCall::new("a", "f", "{}")]),
                Message::tool_result("a", "ra"),
                Message::assistant("done"),
            ]
        );
    }
}
