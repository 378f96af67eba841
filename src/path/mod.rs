//! Path templates — tokenization and matching of `"/a/{id}/b"` style routes.
//!
//! A template is an ordered sequence of segments; each segment is a sequence
//! of tokens, either literal strings or named variables `{name}`. Literals
//! compare case-insensitively (both sides lowercased); variables capture the
//! original substring and must be non-empty.
//!
//! Templates consisting of a single segment holding a single literal token
//! are *exact* and are served from the router's fast map instead of the
//! tokenized list.

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised when a template fails to tokenize. Fatal at registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed '{{' in template segment {segment:?}")]
    UnclosedVariable { segment: String },

    #[error("empty variable name in template segment {segment:?}")]
    EmptyVariable { segment: String },

    #[error("empty segment in template {template:?}")]
    EmptySegment { template: String },
}

/// One token of a template segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A literal run, stored lowercased for matching.
    Literal(String),
    /// A named variable `{name}`.
    Variable(String),
}

/// One `/`-delimited segment of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    tokens: Vec<Token>,
}

impl Segment {
    /// Matches this segment's tokens against one concrete path segment.
    ///
    /// Literals are compared against the lowercased candidate; variable
    /// captures are taken from the original. Variables are non-greedy: a
    /// variable followed by a literal captures up to the literal's earliest
    /// occurrence.
    fn match_segment(&self, candidate: &str, shape: &mut PathShape) -> bool {
        let lowered = candidate.to_ascii_lowercase();
        let mut pos = 0usize;
        let mut captured: Vec<(&str, std::ops::Range<usize>)> = Vec::new();

        let token_count = self.tokens.len();
        let mut tokens = self.tokens.iter().enumerate().peekable();
        while let Some((idx, token)) = tokens.next() {
            match token {
                Token::Literal(lit) => {
                    if !lowered[pos..].starts_with(lit.as_str()) {
                        return false;
                    }
                    pos += lit.len();
                }
                Token::Variable(name) => {
                    if pos >= lowered.len() {
                        return false; // nothing left to capture
                    }
                    let capture_end = match tokens.peek() {
                        // A literal closing the segment anchors to the end.
                        Some((_, Token::Literal(next_lit))) if idx + 2 == token_count => {
                            if lowered.len() < next_lit.len() + pos + 1
                                || !lowered.ends_with(next_lit.as_str())
                            {
                                return false;
                            }
                            lowered.len() - next_lit.len()
                        }
                        Some((_, Token::Literal(next_lit))) => {
                            // Non-empty capture, then the next literal's
                            // earliest occurrence past the first character.
                            let search = &lowered[pos..];
                            let first_char = search
                                .chars()
                                .next()
                                .map(char::len_utf8)
                                .unwrap_or(1);
                            match search[first_char..].find(next_lit.as_str()) {
                                Some(i) => pos + first_char + i,
                                None => return false,
                            }
                        }
                        // Adjacent variables cannot be delimited; the first
                        // takes everything. A trailing variable also takes
                        // the rest.
                        _ => lowered.len(),
                    };
                    if capture_end == pos {
                        return false; // variables are required non-empty
                    }
                    captured.push((name, pos..capture_end));
                    pos = capture_end;
                }
            }
        }

        if pos != lowered.len() {
            return false;
        }
        for (name, range) in captured {
            shape.insert(name.to_owned(), candidate[range].to_owned());
        }
        true
    }
}

/// A parsed path template.
///
/// # Examples
///
/// ```
/// use opserve::path::PathTemplate;
///
/// let template = PathTemplate::parse("/items/{id}/children").unwrap();
/// assert!(!template.is_exact());
///
/// let shape = template.match_path("/items/abc/children").unwrap();
/// assert_eq!(shape.get("id"), Some("abc"));
///
/// assert!(template.match_path("/items/abc").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Tokenizes a template string.
    ///
    /// Splits on `/`; leading and trailing empty segments are normalized
    /// away, interior empty segments are rejected. Within each segment,
    /// alternating literal/variable tokens are parsed; an unclosed or empty
    /// `{}` fails.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let trimmed = template.trim_start_matches('/').trim_end_matches('/');
        let mut segments = Vec::new();

        if !trimmed.is_empty() {
            for part in trimmed.split('/') {
                if part.is_empty() {
                    return Err(TemplateError::EmptySegment {
                        template: template.to_owned(),
                    });
                }
                segments.push(Self::tokenize_segment(part)?);
            }
        }

        Ok(Self {
            raw: template.to_owned(),
            segments,
        })
    }

    fn tokenize_segment(part: &str) -> Result<Segment, TemplateError> {
        let mut tokens = Vec::new();
        let mut rest = part;

        while !rest.is_empty() {
            match rest.find('{') {
                None => {
                    tokens.push(Token::Literal(rest.to_ascii_lowercase()));
                    rest = "";
                }
                Some(open) => {
                    if open > 0 {
                        tokens.push(Token::Literal(rest[..open].to_ascii_lowercase()));
                    }
                    let after_open = &rest[open + 1..];
                    let close = after_open.find('}').ok_or_else(|| {
                        TemplateError::UnclosedVariable {
                            segment: part.to_owned(),
                        }
                    })?;
                    let name = &after_open[..close];
                    if name.is_empty() {
                        return Err(TemplateError::EmptyVariable {
                            segment: part.to_owned(),
                        });
                    }
                    tokens.push(Token::Variable(name.to_owned()));
                    rest = &after_open[close + 1..];
                }
            }
        }

        Ok(Segment { tokens })
    }

    /// The template string as registered.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `true` iff the template is a single segment holding a single literal.
    pub fn is_exact(&self) -> bool {
        self.segments.len() == 1
            && self.segments[0].tokens.len() == 1
            && matches!(self.segments[0].tokens[0], Token::Literal(_))
    }

    /// The lowercased lookup key for exact templates, `None` otherwise.
    pub fn exact_key(&self) -> Option<String> {
        if !self.is_exact() {
            return None;
        }
        match &self.segments[0].tokens[0] {
            Token::Literal(lit) => Some(format!("/{lit}")),
            Token::Variable(_) => None,
        }
    }

    /// Matches a concrete path against this template.
    ///
    /// The path is split on `/` with leading/trailing empties normalized
    /// away; the segment counts must agree exactly (no wildcards). Returns
    /// the captured variable shape on success.
    pub fn match_path(&self, path: &str) -> Option<PathShape> {
        let trimmed = path.trim_start_matches('/').trim_end_matches('/');
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };

        if parts.len() != self.segments.len() {
            return None;
        }

        let mut shape = PathShape::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            if !segment.match_segment(part, &mut shape) {
                return None;
            }
        }
        Some(shape)
    }
}

/// The mapping from template variable names to matched substrings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathShape {
    vars: HashMap<String, String>,
}

impl PathShape {
    /// An empty shape (exact-route matches carry no variables).
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a variable to its matched substring.
    pub fn insert(&mut self, name: String, value: String) {
        self.vars.insert(name, value);
    }

    /// Returns the substring captured for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Iterates over all `(name, value)` bindings.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// `true` if no variables are bound.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
