//! Reply parsing for the line-prefixed formats requested by
//! [`PlainComposer`](super::PlainComposer).

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDecision {
    pub reasoning: String,
    pub action: String,
    /// Replacement goals, when the reply stated any.
    pub goals: Option<Vec<String>>,
}

fn section_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*(REASONING|ACTION|GOALS)\s*:").expect("valid section regex"))
}

fn recipient_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*TO\s*:\s*(\S+)\s*$").expect("valid recipient regex"))
}

fn issue_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*ISSUE\s*:\s*(.+)$").expect("valid issue regex"))
}

/// Splits a reply into its REASONING / ACTION / GOALS sections. A reply with
/// no markers is taken as the action itself. Returns `None` when no action
/// text can be found.
pub fn parse_decision(text: &str) -> Option<ParsedDecision> {
    let markers: Vec<_> = section_marker().captures_iter(text).collect();
    if markers.is_empty() {
        let action = text.trim();
        return (!action.is_empty()).then(|| ParsedDecision {
            reasoning: String::new(),
            action: action.to_string(),
            goals: None,
        });
    }

    let mut reasoning = String::new();
    let mut action = String::new();
    let mut goals = None;

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let body = text[whole.end()..end].trim();
        match label.as_str().to_ascii_uppercase().as_str() {
            "REASONING" => reasoning = body.to_string(),
            "ACTION" => action = body.to_string(),
            _ => {
                let list: Vec<String> = body
                    .split(';')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect();
                if !list.is_empty() {
                    goals = Some(list);
                }
            }
        }
    }

    (!action.is_empty()).then_some(ParsedDecision {
        reasoning,
        action,
        goals,
    })
}

/// Returns the addressed actor (`None` for everyone) and the message body.
pub fn parse_communication(text: &str) -> (Option<String>, String) {
    let mut lines = text.trim().lines();
    let first = lines.next().unwrap_or_default();
    match recipient_marker().captures(first).and_then(|c| c.get(1)) {
        Some(to) => {
            let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
            let to = to.as_str().trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_');
            let recipient = (!to.eq_ignore_ascii_case("all")).then(|| to.to_string());
            (recipient, body)
        }
        None => (None, text.trim().to_string()),
    }
}

/// Lines flagged `ISSUE:` in a validator reply.
pub fn parse_issues(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| issue_marker().captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}
