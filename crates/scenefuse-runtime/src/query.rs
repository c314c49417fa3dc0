//! Query parsing: free text → [`QueryComponents`].
//!
//! Two implementations of [`QueryParser`]:
//!
//! - [`RuleBasedParser`] splits the query on the first spatial-relation
//!   phrase it finds ("the lamp **on** the table") and collects colour words
//!   as target attributes.
//! - [`LlmQueryParser`] asks an OpenAI-compatible chat endpoint (e.g. a local
//!   Ollama server) for the components, constraining the reply with the JSON
//!   Schema of [`QueryComponents`].  Any failure falls back to the rule-based
//!   parse, so parsing never fails.
//!
//! # Example
//!
//! ```rust
//! use scenefuse_runtime::query::{QueryParser, RuleBasedParser};
//!
//! let q = RuleBasedParser.parse("the red apple on top of the wooden table");
//! assert_eq!(q.target, "apple");
//! assert_eq!(q.anchor.as_deref(), Some("wooden table"));
//! assert_eq!(q.relation.as_deref(), Some("on"));
//! assert_eq!(q.target_attributes, ["red"]);
//! ```

use std::time::Duration;

use schemars::schema_for;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use scenefuse_types::QueryComponents;

// ─────────────────────────────────────────────────────────────────────────────
// QueryParser
// ─────────────────────────────────────────────────────────────────────────────

/// Turns a free-text grounding query into its components.
pub trait QueryParser {
    fn parse(&self, query: &str) -> QueryComponents;

    /// Short label recorded in result metadata.
    fn name(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// RuleBasedParser
// ─────────────────────────────────────────────────────────────────────────────

/// Relation names and the phrases that express them, checked in this order.
/// Within a relation, longer phrases come first.
const RELATION_PHRASES: &[(&str, &[&str])] = &[
    ("on", &["on top of", "on"]),
    ("above", &["above", "over"]),
    ("below", &["below", "under", "beneath"]),
    ("near", &["next to", "near", "beside"]),
    ("left", &["to the left of", "left of", "to the left"]),
    ("right", &["to the right of", "right of", "to the right"]),
    ("inside", &["inside", "within", "in"]),
];

const COLOURS: &[&str] = &[
    "red", "blue", "green", "yellow", "black", "white", "brown", "gray", "orange",
];

const ARTICLES: &[&str] = &["the", "a", "an"];

/// Keyword-based parser; needs no external service.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedParser;

impl QueryParser for RuleBasedParser {
    fn parse(&self, query: &str) -> QueryComponents {
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();

        let target_attributes: Vec<String> = COLOURS
            .iter()
            .filter(|c| words.iter().any(|w| w == *c))
            .map(|c| c.to_string())
            .collect();

        let Some((relation, start, len)) = find_relation(&words) else {
            return QueryComponents {
                target: phrase(&words, &target_attributes),
                target_attributes,
                ..QueryComponents::default()
            };
        };

        let anchor = phrase(&words[start + len..], &[]);
        QueryComponents {
            target: phrase(&words[..start], &target_attributes),
            anchor: (!anchor.is_empty()).then_some(anchor),
            relation: Some(relation.to_string()),
            target_attributes,
        }
    }

    fn name(&self) -> &str {
        "rule-based"
    }
}

/// First relation phrase in table order, as `(relation, word index, word count)`.
fn find_relation(words: &[String]) -> Option<(&'static str, usize, usize)> {
    for &(relation, phrases) in RELATION_PHRASES {
        for p in phrases {
            let needle: Vec<&str> = p.split(' ').collect();
            if let Some(pos) = words
                .windows(needle.len())
                .position(|w| w.iter().zip(&needle).all(|(a, b)| a == b))
            {
                return Some((relation, pos, needle.len()));
            }
        }
    }
    None
}

/// Join `words` after stripping leading articles, a trailing "of" and any
/// word listed in `drop`.  Falls back to the article-stripped phrase when
/// dropping would leave nothing.
fn phrase(words: &[String], drop: &[String]) -> String {
    let mut slice = words;
    while let Some((first, rest)) = slice.split_first() {
        if ARTICLES.contains(&first.as_str()) {
            slice = rest;
        } else {
            break;
        }
    }
    if let Some((last, rest)) = slice.split_last() {
        if last == "of" {
            slice = rest;
        }
    }
    let kept: Vec<&str> = slice
        .iter()
        .map(String::as_str)
        .filter(|w| !drop.iter().any(|d| d == w))
        .collect();
    if kept.is_empty() {
        slice.join(" ")
    } else {
        kept.join(" ")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmQueryParser
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from the language-model round trip.  Never escape the parser.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The reply could not be turned into query components.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

const SYSTEM_PROMPT: &str = "\
You extract the parts of a 3D visual grounding query.
Return only a JSON object with the keys:
- \"target\": the object to locate
- \"anchor\": the reference object, or null
- \"relation\": one of on, above, below, left, right, near, inside, or null
- \"target_attributes\": descriptive attributes of the target such as colour or material";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// OpenAI-compatible chat client that parses queries with a language model.
pub struct LlmQueryParser {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    fallback: RuleBasedParser,
}

impl LlmQueryParser {
    /// Create a parser for `base_url` (e.g. `"http://localhost:11434"`) using
    /// `model`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            client,
            fallback: RuleBasedParser,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One round trip to the model.
    pub fn request(&self, query: &str) -> Result<QueryComponents, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let schema = serde_json::to_value(schema_for!(QueryComponents)).unwrap_or(serde_json::Value::Null);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: format!("Query: \"{query}\""),
                },
            ],
            stream: false,
            temperature: 0.1,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: schema,
            },
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response: ChatResponse = req.send()?.error_for_status()?.json()?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))?;
        parse_reply(&content)
    }
}

impl QueryParser for LlmQueryParser {
    fn parse(&self, query: &str) -> QueryComponents {
        match self.request(query) {
            Ok(components) if components.target_label().is_some() => {
                debug!(model = %self.model, ?components, "query parsed by model");
                components
            }
            Ok(_) => {
                warn!(model = %self.model, "model returned no target, using rule-based parse");
                self.fallback.parse(query)
            }
            Err(e) => {
                warn!(model = %self.model, error = %e, "model query parse failed, using rule-based parse");
                self.fallback.parse(query)
            }
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Deserialise the first `{ ... }` object found in a model reply.
fn parse_reply(content: &str) -> Result<QueryComponents, LlmError> {
    let json = extract_json_object(content)
        .ok_or_else(|| LlmError::BadResponse(format!("no JSON object in reply: {content}")))?;
    serde_json::from_str(json).map_err(|e| LlmError::BadResponse(e.to_string()))
}

/// The first balanced `{ ... }` span in `text`, ignoring braces inside
/// string literals.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
