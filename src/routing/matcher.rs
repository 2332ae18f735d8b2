//! Path pattern matching.
//!
//! # Responsibilities
//! - Compile path patterns into anchored regular expressions
//! - Extract named and positional params from a pathname
//! - Cache compiled patterns, bounded by a hard entry ceiling
//!
//! # Pattern Grammar
//! - `/users` literal text (case-insensitive)
//! - `/:id` named segment, `/:id?` optional, `/:path*` zero or more, `/:path+` one or more
//! - `/:id(\d+)` inline regex constraint, `/(\d+)` unnamed positional group
//! - `/*` bare wildcard (`.*`)
//!
//! # Design Decisions
//! - Trailing slashes are tolerated (non-strict)
//! - Non-exact patterns match on a segment boundary, never mid-segment
//! - `/` is special-cased: it matches every pathname under the base path
//! - Once the cache is full, new patterns are compiled but not retained

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::routing::route::Match;
use crate::routing::router::RoutingError;

/// Maximum number of compiled patterns retained by a [`PatternCache`].
pub const PATTERN_CACHE_LIMIT: usize = 10_000;

const DEFAULT_SEGMENT: &str = "[^/]+?";

/// Compilation flags; part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompileOptions {
    /// Anchor the pattern at the end of the input.
    pub end: bool,
    /// Treat a trailing slash as significant.
    pub strict: bool,
    /// Case-sensitive matching.
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Param {
        key: String,
        prefix: String,
        pattern: String,
        optional: bool,
        repeat: bool,
    },
}

/// A pattern compiled to a regular expression plus its ordered param keys.
#[derive(Debug)]
pub struct CompiledPattern {
    regex: Regex,
    keys: Vec<String>,
    /// The expression consumes the boundary `/` after the match.
    trims_boundary: bool,
}

impl CompiledPattern {
    /// Compile a pattern.
    pub fn compile(pattern: &str, options: CompileOptions) -> Result<Self, RoutingError> {
        let tokens = tokenize(pattern)?;
        let keys = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Param { key, .. } => Some(key.clone()),
                Token::Literal(_) => None,
            })
            .collect();

        let (source, trims_boundary) = to_regex_source(&tokens, options);
        let regex = Regex::new(&source).map_err(|e| RoutingError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            regex,
            keys,
            trims_boundary,
        })
    }

    /// Param names in pattern order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Match `input`, returning the consumed url and the extracted params.
    pub fn exec(&self, input: &str) -> Option<(String, BTreeMap<String, String>)> {
        let caps = self.regex.captures(input)?;
        let whole = caps.get(0)?;

        let mut url = whole.as_str();
        if self.trims_boundary && url.ends_with('/') && whole.end() < input.len() {
            url = &url[..url.len() - 1];
        }

        let params = self
            .keys
            .iter()
            .enumerate()
            .filter_map(|(i, key)| caps.get(i + 1).map(|m| (key.clone(), m.as_str().to_string())))
            .collect();

        Some((url.to_string(), params))
    }
}

fn tokenize(pattern: &str) -> Result<Vec<Token>, RoutingError> {
    let invalid = |reason: &str| RoutingError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut positional = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' {
            if let Some(&escaped) = chars.get(i + 1) {
                literal.push(escaped);
                i += 2;
            } else {
                literal.push(c);
                i += 1;
            }
            continue;
        }

        if c != ':' && c != '(' && c != '*' {
            literal.push(c);
            i += 1;
            continue;
        }

        let mut j = i;
        let mut name = String::new();
        if c == ':' {
            j += 1;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                name.push(chars[j]);
                j += 1;
            }
            if name.is_empty() {
                literal.push(c);
                i += 1;
                continue;
            }
        }

        let mut group = None;
        if c == '*' {
            j += 1;
            group = Some(".*".to_string());
        } else if j < chars.len() && chars[j] == '(' {
            let close = find_group_end(&chars, j).ok_or_else(|| invalid("unbalanced parenthesis"))?;
            let inner: String = chars[j + 1..close].iter().collect();
            if inner.is_empty() {
                return Err(invalid("empty group"));
            }
            group = Some(non_capturing(&inner));
            j = close + 1;
        }

        let (optional, repeat) = match chars.get(j) {
            Some('?') if c != '*' => (true, false),
            Some('*') if c != '*' => (true, true),
            Some('+') if c != '*' => (false, true),
            _ => (false, false),
        };
        if optional || repeat {
            j += 1;
        }

        let prefix = match literal.chars().last() {
            Some(p @ ('/' | '.')) => {
                literal.pop();
                p.to_string()
            }
            _ => String::new(),
        };
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }

        let key = if name.is_empty() {
            positional += 1;
            (positional - 1).to_string()
        } else {
            name
        };

        tokens.push(Token::Param {
            key,
            prefix,
            pattern: group.unwrap_or_else(|| DEFAULT_SEGMENT.to_string()),
            optional,
            repeat,
        });
        i = j;
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// Index of the `)` closing the group opened at `open`.
fn find_group_end(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut k = open;
    while k < chars.len() {
        match chars[k] {
            '\\' => k += 1,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(k);
                }
            }
            _ => {}
        }
        k += 1;
    }
    None
}

/// Rewrite capturing groups inside a user regex so capture indexes stay aligned with keys.
fn non_capturing(group: &str) -> String {
    let mut out = String::with_capacity(group.len() + 8);
    let mut chars = group.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '(' if chars.peek() != Some(&'?') => out.push_str("(?:"),
            _ => out.push(c),
        }
    }
    out
}

fn to_regex_source(tokens: &[Token], options: CompileOptions) -> (String, bool) {
    let mut route = String::new();

    for token in tokens {
        match token {
            Token::Literal(text) => route.push_str(&regex::escape(text)),
            Token::Param {
                prefix,
                pattern,
                optional,
                repeat,
                ..
            } => {
                let prefix = regex::escape(prefix);
                let mut capture = pattern.clone();
                if *repeat {
                    capture = format!("(?:{pattern})(?:{prefix}(?:{pattern}))*");
                }
                let part = match (*optional, prefix.is_empty()) {
                    (true, false) => format!("(?:{prefix}({capture}))?"),
                    (true, true) => format!("({capture})?"),
                    (false, _) => format!("{prefix}({capture})"),
                };
                route.push_str(&part);
            }
        }
    }

    let ends_with_delimiter = route.ends_with('/');
    if !options.strict && ends_with_delimiter {
        route.pop();
    }

    let (body, trims_boundary) = match (options.end, options.strict) {
        (true, true) => (format!("{route}$"), false),
        (true, false) => (format!("{route}/?$"), false),
        (false, true) if ends_with_delimiter => (route, false),
        (false, _) => (format!("{route}(?:/|$)"), true),
    };

    let flags = if options.sensitive { "" } else { "(?i)" };
    (format!("{flags}^{body}"), trims_boundary)
}

/// Bounded cache of compiled patterns keyed by flags and pattern text.
#[derive(Debug)]
pub struct PatternCache {
    entries: DashMap<(CompileOptions, String), Arc<CompiledPattern>>,
    limit: usize,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::with_limit(PATTERN_CACHE_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
        }
    }

    /// Compile `pattern`, reusing a cached compilation when present.
    pub fn compile(
        &self,
        pattern: &str,
        options: CompileOptions,
    ) -> Result<Arc<CompiledPattern>, RoutingError> {
        let key = (options, pattern.to_string());
        if let Some(hit) = self.entries.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }

        let compiled = Arc::new(CompiledPattern::compile(pattern, options)?);
        if self.entries.len() < self.limit {
            self.entries.insert(key, Arc::clone(&compiled));
        }
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`match_path`].
#[derive(Debug, Clone, Copy)]
pub struct PathOptions<'a> {
    pub path: &'a str,
    pub exact: bool,
    pub base_path: &'a str,
}

/// Base path without its trailing slash.
pub(crate) fn normalize_base(base_path: &str) -> &str {
    base_path.trim_end_matches('/')
}

/// Match `pathname` against a route pattern mounted under `base_path`.
///
/// Returns `None` on no match, including when the pattern cannot be compiled.
pub fn match_path(cache: &PatternCache, pathname: &str, options: PathOptions<'_>) -> Option<Match> {
    let base_path = normalize_base(options.base_path);

    if options.path == "/" {
        return match_root(pathname, base_path, options.exact);
    }

    let full = format!("{base_path}{}", options.path);
    let compiled = match cache.compile(
        &full,
        CompileOptions {
            end: options.exact,
            ..CompileOptions::default()
        },
    ) {
        Ok(compiled) => compiled,
        Err(e) => {
            tracing::debug!(pattern = %full, error = %e, "Skipping uncompilable pattern");
            return None;
        }
    };

    let (url, params) = compiled.exec(pathname)?;
    let is_exact = url == pathname;
    if options.exact && !is_exact {
        return None;
    }

    Some(Match {
        path: options.path.to_string(),
        url,
        is_exact,
        params,
        query: BTreeMap::new(),
    })
}

fn match_root(pathname: &str, base_path: &str, exact: bool) -> Option<Match> {
    let rest = pathname.strip_prefix(base_path)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }

    let is_exact = rest.is_empty() || rest == "/";
    if exact && !is_exact {
        return None;
    }

    let url = if is_exact {
        pathname.to_string()
    } else {
        format!("{base_path}/")
    };

    Some(Match {
        path: "/".to_string(),
        url,
        is_exact,
        params: BTreeMap::new(),
        query: BTreeMap::new(),
    })
}

/// Whether a single trie segment key (`:id(\d+)`) accepts `segment`.
pub(crate) fn segment_matches(cache: &PatternCache, key: &str, segment: &str) -> bool {
    let options = CompileOptions {
        end: true,
        ..CompileOptions::default()
    };
    cache
        .compile(&format!("/{key}"), options)
        .map(|compiled| compiled.exec(&format!("/{segment}")).is_some())
        .unwrap_or(false)
}
