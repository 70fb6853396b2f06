//! C10 — Query Understanding: the always-available keyword path (spec.md
//! §4.9). An optional embedding-based classifier is named in the spec as a
//! second implementation behind the same trait; it is not built here (see
//! DESIGN.md, Open Questions) — the keyword path is the only one shipped
//! and never errors, so there is nothing to fall back from.

use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionIntent {
    Find,
    Explain,
    List,
    Fix,
    Compare,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Function,
    Class,
    Variable,
    File,
    Error,
    Test,
    Config,
    Api,
    Database,
    Auth,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedQuery {
    pub original: String,
    pub normalized: String,
    pub keywords: Vec<String>,
    pub code_terms: Vec<String>,
    pub action_intent: ActionIntent,
    pub target_type: TargetType,
    pub expanded: Vec<String>,
    pub search_query: String,
    pub confidence: f32,
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on", "at", "for",
    "with", "by", "and", "or", "do", "does", "this", "that", "it", "as", "from",
];

/// Longest-phrase-first pattern table, `(phrase, intent)` (spec.md §4.9
/// step 3).
const INTENT_PATTERNS: &[(&str, ActionIntent)] = &[
    ("where is", ActionIntent::Find),
    ("where are", ActionIntent::Find),
    ("how does", ActionIntent::Explain),
    ("how do", ActionIntent::Explain),
    ("what does", ActionIntent::Explain),
    ("explain", ActionIntent::Explain),
    ("list all", ActionIntent::List),
    ("show all", ActionIntent::List),
    ("list", ActionIntent::List),
    ("find", ActionIntent::Find),
    ("search for", ActionIntent::Find),
    ("fix", ActionIntent::Fix),
    ("debug", ActionIntent::Fix),
    ("compare", ActionIntent::Compare),
    ("difference between", ActionIntent::Compare),
];

/// `(noun, target)` pattern table (spec.md §4.9 step 4).
const TARGET_PATTERNS: &[(&str, TargetType)] = &[
    ("function", TargetType::Function),
    ("method", TargetType::Function),
    ("class", TargetType::Class),
    ("struct", TargetType::Class),
    ("variable", TargetType::Variable),
    ("field", TargetType::Variable),
    ("file", TargetType::File),
    ("module", TargetType::File),
    ("error", TargetType::Error),
    ("exception", TargetType::Error),
    ("test", TargetType::Test),
    ("config", TargetType::Config),
    ("configuration", TargetType::Config),
    ("api", TargetType::Api),
    ("endpoint", TargetType::Api),
    ("database", TargetType::Database),
    ("query", TargetType::Database),
    ("auth", TargetType::Auth),
    ("authentication", TargetType::Auth),
    ("login", TargetType::Auth),
];

/// Code-domain terms and their synonyms (spec.md §4.9 step 5/6).
const SYNONYMS: &[(&str, &[&str])] = &[
    ("function", &["fn", "method", "func", "procedure"]),
    ("class", &["struct", "type", "object"]),
    ("error", &["exception", "err", "failure"]),
    ("auth", &["authentication", "login", "authorization"]),
    ("config", &["configuration", "settings", "options"]),
    ("api", &["endpoint", "route", "handler"]),
    ("database", &["db", "store", "table"]),
    ("test", &["spec", "suite", "assertion"]),
    ("delete", &["remove", "destroy", "drop"]),
    ("create", &["add", "new", "insert"]),
];

fn normalize(q: &str) -> String {
    q.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokenize(normalized: &str) -> Vec<String> {
    normalized
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn longest_match<'a, T: Copy>(normalized: &str, table: &'a [(&str, T)]) -> Option<T> {
    table
        .iter()
        .filter(|(phrase, _)| normalized.contains(phrase))
        .max_by_key(|(phrase, _)| phrase.len())
        .map(|(_, val)| *val)
}

fn is_code_term(word: &str) -> bool {
    SYNONYMS.iter().any(|(term, syns)| *term == word || syns.contains(&word))
}

fn synonyms_of(word: &str) -> Vec<String> {
    for (term, syns) in SYNONYMS {
        if *term == word {
            return syns.iter().map(|s| s.to_string()).collect();
        }
        if syns.contains(&word) {
            let mut out = vec![term.to_string()];
            out.extend(syns.iter().filter(|s| **s != word).map(|s| s.to_string()));
            return out;
        }
    }
    Vec::new()
}

/// Parse a raw query string with the keyword-path algorithm (spec.md §4.9).
pub fn parse_query(raw: &str) -> ParsedQuery {
    let normalized = normalize(raw);
    let keywords = tokenize(&normalized);

    let action_intent = longest_match(&normalized, INTENT_PATTERNS).unwrap_or(ActionIntent::Unknown);
    let target_type = longest_match(&normalized, TARGET_PATTERNS).unwrap_or(TargetType::Unknown);

    let code_terms: Vec<String> = keywords.iter().filter(|k| is_code_term(k)).cloned().collect();

    let mut expanded = Vec::new();
    let mut seen = HashSet::new();
    for k in &keywords {
        if seen.insert(k.clone()) {
            expanded.push(k.clone());
        }
    }
    for term in &code_terms {
        for syn in synonyms_of(term) {
            if seen.insert(syn.clone()) {
                expanded.push(syn);
            }
        }
    }

    let search_query = match action_intent {
        ActionIntent::Find => strip_leading_phrase(&normalized, INTENT_PATTERNS),
        ActionIntent::Explain => normalized.clone(),
        _ => expanded.join(" "),
    };

    let mut confidence: f32 = 0.5;
    if action_intent != ActionIntent::Unknown {
        confidence += 0.2;
    }
    if target_type != TargetType::Unknown {
        confidence += 0.2;
    }
    if (2..=6).contains(&keywords.len()) {
        confidence += 0.1;
    }
    confidence = confidence.min(1.0);

    ParsedQuery {
        original: raw.to_string(),
        normalized,
        keywords,
        code_terms,
        action_intent,
        target_type,
        expanded,
        search_query,
        confidence,
    }
}

fn strip_leading_phrase(normalized: &str, table: &[(&str, ActionIntent)]) -> String {
    let matched = table
        .iter()
        .filter(|(phrase, intent)| *intent == ActionIntent::Find && normalized.starts_with(phrase))
        .max_by_key(|(phrase, _)| phrase.len());
    match matched {
        Some((phrase, _)) => normalized[phrase.len()..].trim().to_string(),
        None => normalized.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_find_intent_and_strips_phrase() {
        let parsed = parse_query("where is the login function defined");
        assert_eq!(parsed.action_intent, ActionIntent::Find);
        assert_eq!(parsed.target_type, TargetType::Function);
        assert_eq!(parsed.search_query, "login function defined");
    }

    #[test]
    fn explain_intent_keeps_full_query() {
        let parsed = parse_query("how does authentication work");
        assert_eq!(parsed.action_intent, ActionIntent::Explain);
        assert_eq!(parsed.search_query, "how does authentication work");
    }

    #[test]
    fn unknown_intent_falls_back_to_expanded_join() {
        let parsed = parse_query("banana smoothie recipe");
        assert_eq!(parsed.action_intent, ActionIntent::Unknown);
        assert_eq!(parsed.search_query, parsed.expanded.join(" "));
    }

    #[test]
    fn expands_code_term_synonyms_deduplicated() {
        let parsed = parse_query("fix the auth error");
        assert!(parsed.expanded.contains(&"authentication".to_string()));
        assert!(parsed.expanded.contains(&"exception".to_string()));
        let unique: HashSet<&String> = parsed.expanded.iter().collect();
        assert_eq!(unique.len(), parsed.expanded.len());
    }

    #[test]
    fn confidence_rewards_known_intent_and_target() {
        let known = parse_query("list all api endpoints");
        let unknown = parse_query("xyz abc");
        assert!(known.confidence > unknown.confidence);
        assert!(known.confidence <= 1.0);
    }

    #[test]
    fn stop_words_and_short_tokens_are_dropped() {
        let parsed = parse_query("is a of to it");
        assert!(parsed.keywords.is_empty());
    }
}
