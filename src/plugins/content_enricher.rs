use std::collections::BTreeSet;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::model::Clip;
use crate::plugin::{HookContext, Plugin, PluginError, PluginOptions, PriorityTier};

pub const NAME: &str = "ContentEnricher";
pub const TYPE_SIGNAL: &str = "content.type";

const LANGUAGES: &[(&str, &[&str])] = &[
    (
        "python",
        &[
            r"(?m)^\s*def\s+\w+\s*\(",
            r"(?m)^\s*class\s+\w+.*:\s*$",
            r"(?m)^\s*import\s+[\w.]+\s*$",
            r"(?m)^\s*from\s+[\w.]+\s+import\s+",
        ],
    ),
    (
        "javascript",
        &[
            r"(?m)^\s*function\s+\w+\s*\(",
            r"(?m)^\s*(const|let|var)\s+\w+\s*=",
            r"=>\s*\{",
        ],
    ),
    (
        "java",
        &[
            r"(?m)^\s*public\s+(static\s+)?(final\s+)?(class|interface|enum)\s+\w+",
            r"(?m)^\s*(public|private|protected)\s+(static\s+)?\w+(<[^>]*>)?\s+\w+\s*\(",
        ],
    ),
    (
        "cpp",
        &[
            r#"(?m)^\s*#include\s*[<"]"#,
            r"(?m)^\s*using\s+namespace\s+\w+",
            r"\bstd::\w+",
        ],
    ),
    (
        "go",
        &[
            r"(?m)^\s*package\s+\w+\s*$",
            r"(?m)^\s*func\s+(\(\w+\s+\*?\w+\)\s*)?\w+\s*\(",
        ],
    ),
    (
        "rust",
        &[
            r"(?m)^\s*(pub\s+)?(async\s+)?fn\s+\w+\s*[<(]",
            r"(?m)^\s*use\s+\w+(::\w+)*(::\{[^}]*\})?;",
            r"(?m)^\s*impl\b.*\{",
        ],
    ),
    (
        "sql",
        &[
            r"(?m)^\s*SELECT\s+.+\s+FROM\s+",
            r"(?m)^\s*INSERT\s+INTO\s+",
            r"(?m)^\s*UPDATE\s+\w+\s+SET\s+",
            r"(?m)^\s*DELETE\s+FROM\s+",
        ],
    ),
    (
        "html",
        &[
            r"(?mi)^\s*<!DOCTYPE\s+html",
            r"(?m)^\s*<(html|head|body|div|span|p|ul|table)\b[^>]*>",
        ],
    ),
    ("css", &[r"(?m)^\s*[.#][\w-]+\s*\{", r"(?m)^\s*@media\b"]),
    (
        "shell",
        &[
            r"(?m)^\s*#!/(usr/)?bin/(env\s+)?(bash|sh|zsh)",
            r"(?m)^\s*sudo\s+\w+",
            r"(?m)^\s*apt(-get)?\s+install\b",
        ],
    ),
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "wonderful", "fantastic", "love", "happy", "best",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "hate", "worst", "sad", "angry", "disappointed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Url,
    Email,
    Json,
    Code,
    Text,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Url => "url",
            ContentType::Email => "email",
            ContentType::Json => "json",
            ContentType::Code => "code",
            ContentType::Text => "text",
        }
    }

    /// How sure the classifier is. Structural matches are near certain.
    fn confidence(self) -> f64 {
        match self {
            ContentType::Url | ContentType::Email | ContentType::Json => 0.95,
            ContentType::Code => 0.7,
            ContentType::Text => 0.6,
        }
    }
}

struct Patterns {
    email: Regex,
    embedded_email: Regex,
    phone: Regex,
    function: Regex,
    class: Regex,
    languages: Vec<(&'static str, Vec<Regex>)>,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        let mut languages = Vec::with_capacity(LANGUAGES.len());
        for (language, sources) in LANGUAGES {
            let compiled = sources
                .iter()
                .map(|source| Regex::new(source))
                .collect::<Result<Vec<_>, _>>()?;
            languages.push((*language, compiled));
        }
        Ok(Self {
            email: Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")?,
            embedded_email: Regex::new(r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b")?,
            phone: Regex::new(r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b")?,
            function: Regex::new(
                r"(?m)^\s*(?:pub\s+)?(?:async\s+)?(?:def|fn|func|function)\s+(\w+)\s*[<(]",
            )?,
            class: Regex::new(r"(?m)^\s*(?:pub\s+)?(?:public\s+)?(?:class|struct|interface)\s+(\w+)")?,
            languages,
        })
    }

    fn language(&self, content: &str) -> Option<&'static str> {
        let mut best: Option<(&'static str, usize)> = None;
        for (language, patterns) in &self.languages {
            let score = patterns.iter().filter(|pattern| pattern.is_match(content)).count();
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((*language, score));
            }
        }
        best.map(|(language, _)| language)
    }
}

/// Classifies clip content and attaches type-specific details.
pub struct ContentEnricher {
    enrich_urls: bool,
    enrich_code: bool,
    enrich_text: bool,
    patterns: Option<Patterns>,
}

impl Default for ContentEnricher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentEnricher {
    pub fn new() -> Self {
        Self {
            enrich_urls: true,
            enrich_code: true,
            enrich_text: true,
            patterns: None,
        }
    }

    fn patterns(&self) -> Result<&Patterns, PluginError> {
        self.patterns
            .as_ref()
            .ok_or_else(|| PluginError::Runtime("content enricher used before initialize".to_string()))
    }

    fn classify(patterns: &Patterns, content: &str) -> ContentType {
        let trimmed = content.trim();
        if split_url(trimmed).is_some() {
            return ContentType::Url;
        }
        if patterns.email.is_match(trimmed) {
            return ContentType::Email;
        }
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<Value>(trimmed).is_ok()
        {
            return ContentType::Json;
        }
        if patterns.language(trimmed).is_some() || looks_like_code(trimmed) {
            return ContentType::Code;
        }
        ContentType::Text
    }

    fn details(&self, patterns: &Patterns, kind: ContentType, content: &str) -> Option<Value> {
        match kind {
            ContentType::Url if self.enrich_urls => url_details(content.trim()),
            ContentType::Code if self.enrich_code => Some(code_details(patterns, content)),
            ContentType::Text if self.enrich_text => Some(text_details(patterns, content)),
            ContentType::Email => Some(email_details(content.trim())),
            ContentType::Json => json_details(content.trim()),
            _ => None,
        }
    }
}

/// Scheme, host, rest. Only single-token http(s)/ftp URLs count.
fn split_url(content: &str) -> Option<(&str, &str, &str)> {
    if content.is_empty() || content.chars().any(char::is_whitespace) {
        return None;
    }
    let (scheme, rest) = content.split_once("://")?;
    if !matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https" | "ftp") {
        return None;
    }
    let end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    let (host, path) = rest.split_at(end);
    if host.is_empty() {
        return None;
    }
    Some((scheme, host, path))
}

fn looks_like_code(content: &str) -> bool {
    let signals = ["#include", "=>", "::", "();", "){"];
    let statement_lines = content
        .lines()
        .filter(|line| {
            let line = line.trim_end();
            line.ends_with(';') || line.ends_with('{') || line.ends_with('}')
        })
        .count();
    signals.iter().any(|signal| content.contains(signal)) || statement_lines >= 2
}

fn url_details(url: &str) -> Option<Value> {
    let (scheme, host, path) = split_url(url)?;
    let domain = host.rsplit_once('@').map_or(host, |(_, domain)| domain);
    let path = if path.is_empty() { "/" } else { path };
    Some(json!({
        "url": url,
        "scheme": scheme.to_ascii_lowercase(),
        "domain": domain.to_ascii_lowercase(),
        "path": path,
    }))
}

fn email_details(address: &str) -> Value {
    json!({
        "email": address,
        "domain": address.rsplit_once('@').map(|(_, domain)| domain.to_ascii_lowercase()),
    })
}

fn json_details(content: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(content).ok()?;
    let (root, entries) = match &parsed {
        Value::Object(map) => ("object", map.len()),
        Value::Array(items) => ("array", items.len()),
        _ => return None,
    };
    Some(json!({ "root": root, "entries": entries }))
}

fn code_details(patterns: &Patterns, content: &str) -> Value {
    let mut details = Map::new();
    details.insert("lines".into(), json!(content.lines().count().max(1)));
    details.insert("chars".into(), json!(content.chars().count()));
    if let Some(language) = patterns.language(content) {
        details.insert("language".into(), json!(language));
    }
    let functions = captures(&patterns.function, content, 10);
    if !functions.is_empty() {
        details.insert("functions".into(), json!(functions));
    }
    let classes = captures(&patterns.class, content, 10);
    if !classes.is_empty() {
        details.insert("classes".into(), json!(classes));
    }
    let comment_lines = content
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            ["#", "//", "/*", "*", "--"].iter().any(|marker| line.starts_with(marker))
        })
        .count();
    details.insert("comment_lines".into(), json!(comment_lines));
    Value::Object(details)
}

fn text_details(patterns: &Patterns, content: &str) -> Value {
    let mut details = Map::new();
    details.insert("word_count".into(), json!(content.split_whitespace().count()));
    details.insert("line_count".into(), json!(content.lines().count().max(1)));
    details.insert("char_count".into(), json!(content.chars().count()));

    let emails = unique_matches(&patterns.embedded_email, content, 5);
    if !emails.is_empty() {
        details.insert("emails".into(), json!(emails));
    }
    let phones = unique_matches(&patterns.phone, content, 5);
    if !phones.is_empty() {
        details.insert("phones".into(), json!(phones));
    }
    if let Some(sentiment) = sentiment(content) {
        details.insert("sentiment".into(), json!(sentiment));
    }
    Value::Object(details)
}

fn captures(pattern: &Regex, content: &str, limit: usize) -> Vec<String> {
    pattern
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|name| name.as_str().to_string()))
        .take(limit)
        .collect()
}

fn unique_matches(pattern: &Regex, content: &str, limit: usize) -> Vec<String> {
    let found: BTreeSet<&str> = pattern.find_iter(content).map(|m| m.as_str()).collect();
    found.into_iter().take(limit).map(str::to_string).collect()
}

fn sentiment(content: &str) -> Option<&'static str> {
    let lower = content.to_lowercase();
    let positive = POSITIVE_WORDS.iter().filter(|word| lower.contains(**word)).count();
    let negative = NEGATIVE_WORDS.iter().filter(|word| lower.contains(**word)).count();
    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Some("positive"),
        std::cmp::Ordering::Less => Some("negative"),
        std::cmp::Ordering::Equal if positive > 0 => Some("neutral"),
        std::cmp::Ordering::Equal => None,
    }
}

#[async_trait]
impl Plugin for ContentEnricher {
    fn name(&self) -> &str {
        NAME
    }

    fn tier(&self) -> PriorityTier {
        PriorityTier::High
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn initialize(&mut self, options: &PluginOptions) -> Result<(), PluginError> {
        self.enrich_urls = options.bool_or("enrich_urls", true)?;
        self.enrich_code = options.bool_or("enrich_code", true)?;
        self.enrich_text = options.bool_or("enrich_text", true)?;
        let patterns = Patterns::compile().map_err(|err| PluginError::Init(err.to_string()))?;
        self.patterns = Some(patterns);
        info!("content enricher ready");
        Ok(())
    }

    async fn process_clip(&self, mut clip: Clip, _ctx: HookContext) -> Result<Clip, PluginError> {
        let patterns = self.patterns()?;
        let kind = Self::classify(patterns, clip.content());

        let mut enrichment = Map::new();
        enrichment.insert("content_type".into(), json!(kind.as_str()));
        enrichment.insert("length".into(), json!(clip.content().chars().count()));
        if let Some(details) = self.details(patterns, kind, clip.content()) {
            enrichment.insert(kind.as_str().into(), details);
        }

        clip.metadata.set_enrichment(NAME, Value::Object(enrichment));
        clip.metadata.add_tag(kind.as_str());
        clip.metadata.set_confidence(TYPE_SIGNAL, kind.confidence());
        debug!(content_type = kind.as_str(), "enriched clip");
        Ok(clip)
    }
}
