//! Turns free-text compiler output into located diagnostic records.
//!
//! Grammar, applied to the whole text:
//!
//! ```text
//! output  := noise? (tag body)*
//! tag     := "[" ("ERROR" | "WARNING" | "INFO" | "DEBUG" | "VERBOSE") "]"   (any case)
//! body    := text up to the next tag or end of input
//! located := path ":" (line ":")? (column ":")? message
//! related := tool ":" (("ERROR" | "WARNING") ":" (file ":" line ":")? text)+
//! ```
//!
//! Only ERROR and WARNING blocks become records; the other tags just end the
//! preceding block. A `located` prefix counts only when `path` names an existing
//! file under the job root or the working directory, otherwise the whole body is
//! an unlocated message attached to the job's primary config. Bodies shaped like
//! `related` (a nested tool's own error lines) are additionally split into
//! related locations, each gated the same way and falling back to the block's
//! location.
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::path::PathResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedLocation {
    pub file: PathBuf,
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub location: SourceLocation,
    pub message: String,
    pub related: Vec<RelatedLocation>,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Highlight range for the column, one character wider on each side so a
    /// point location stays visible.
    pub fn column_range(&self) -> Option<Range<u32>> {
        self.location
            .column
            .map(|column| column.saturating_sub(1)..column.saturating_add(1))
    }
}

pub fn error_count(diagnostics: &[Diagnostic]) -> usize {
    diagnostics.iter().filter(|d| d.is_error()).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl Tag {
    const LONGEST: usize = "VERBOSE".len();

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ERROR" => Some(Self::Error),
            "WARNING" => Some(Self::Warning),
            "INFO" => Some(Self::Info),
            "DEBUG" => Some(Self::Debug),
            "VERBOSE" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn severity(self) -> Option<Severity> {
        match self {
            Self::Error => Some(Severity::Error),
            Self::Warning => Some(Severity::Warning),
            Self::Info | Self::Debug | Self::Verbose => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block<'a> {
    tag: Tag,
    body: &'a str,
}

/// Splits `text` into tag-introduced blocks. Text before the first tag is
/// dropped.
fn tokenize(text: &str) -> Vec<Block<'_>> {
    let mut tags: Vec<(usize, usize, Tag)> = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find('[') {
        let open = cursor + offset;
        let after = open + 1;
        let tag = text[after..]
            .char_indices()
            .take(Tag::LONGEST + 1)
            .find(|(_, ch)| *ch == ']')
            .and_then(|(len, _)| Tag::from_name(&text[after..after + len]).map(|tag| (len, tag)));
        match tag {
            Some((len, tag)) => {
                let end = after + len + 1;
                tags.push((open, end, tag));
                cursor = end;
            }
            None => cursor = after,
        }
    }

    tags.iter()
        .enumerate()
        .map(|(index, &(_, end, tag))| {
            let stop = tags.get(index + 1).map_or(text.len(), |next| next.0);
            Block {
                tag,
                body: text[end..stop].trim(),
            }
        })
        .collect()
}

fn location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?s)^\s*(?P<path>(?:[A-Za-z]:[\\/])?[^:\r\n]+?)\s*:(?:\s*(?P<line>\d+)\s*:)?(?:\s*(?P<column>\d+)\s*:)?(?P<rest>.*)$",
        )
        .expect("location pattern is valid")
    })
}

fn tool_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*[A-Za-z][\w.\-]*\s*:\s*(?:ERROR|WARNING)\s*:")
            .expect("tool prefix pattern is valid")
    })
}

fn sub_marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:ERROR|WARNING)\s*:").expect("sub-diagnostic marker pattern is valid")
    })
}

fn sub_location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^\s*(?P<file>[^:\r\n]+?)\s*:\s*(?P<line>\d+)\s*:(?P<message>.*)$")
            .expect("sub-location pattern is valid")
    })
}

pub struct DiagnosticParser<'a> {
    resolver: &'a PathResolver,
    root: &'a Path,
    primary: &'a Path,
}

impl<'a> DiagnosticParser<'a> {
    pub fn new(resolver: &'a PathResolver, root: &'a Path, primary: &'a Path) -> Self {
        Self {
            resolver,
            root,
            primary,
        }
    }

    pub fn parse(&self, text: &str) -> Vec<Diagnostic> {
        tokenize(text)
            .into_iter()
            .filter_map(|block| {
                let severity = block.tag.severity()?;
                (!block.body.is_empty()).then(|| self.parse_block(severity, block.body))
            })
            .collect()
    }

    fn parse_block(&self, severity: Severity, body: &str) -> Diagnostic {
        let (location, message) = self
            .split_location(body)
            .unwrap_or_else(|| (self.unlocated(), body.to_string()));
        let related = self.decompose(&message, &location);
        Diagnostic {
            severity,
            location,
            message,
            related,
        }
    }

    fn split_location(&self, body: &str) -> Option<(SourceLocation, String)> {
        let captures = location_pattern().captures(body)?;
        let file = self.resolver.locate(captures.name("path")?.as_str(), self.root)?;
        let line = captures
            .name("line")
            .and_then(|m| m.as_str().parse::<u32>().ok());
        let column = captures
            .name("column")
            .and_then(|m| m.as_str().parse::<u32>().ok());
        let rest = captures.name("rest").map_or("", |m| m.as_str()).trim();
        let message = if rest.is_empty() { body } else { rest };
        Some((
            SourceLocation { file, line, column },
            message.to_string(),
        ))
    }

    fn unlocated(&self) -> SourceLocation {
        SourceLocation {
            file: self.primary.to_path_buf(),
            line: None,
            column: None,
        }
    }

    fn decompose(&self, message: &str, fallback: &SourceLocation) -> Vec<RelatedLocation> {
        if !tool_prefix_pattern().is_match(message) {
            return Vec::new();
        }
        let markers: Vec<_> = sub_marker_pattern().find_iter(message).collect();
        markers
            .iter()
            .enumerate()
            .filter_map(|(index, marker)| {
                let stop = markers
                    .get(index + 1)
                    .map_or(message.len(), |next| next.start());
                let segment = message[marker.end()..stop].trim();
                (!segment.is_empty()).then(|| self.related_from(segment, fallback))
            })
            .collect()
    }

    fn related_from(&self, segment: &str, fallback: &SourceLocation) -> RelatedLocation {
        let located = sub_location_pattern().captures(segment).and_then(|captures| {
            let file = self.resolver.locate(captures.name("file")?.as_str(), self.root)?;
            let line = captures.name("line")?.as_str().parse::<u32>().ok()?;
            let message = captures.name("message").map_or("", |m| m.as_str()).trim();
            Some(RelatedLocation {
                file,
                line: Some(line),
                message: message.to_string(),
            })
        });
        located.unwrap_or_else(|| RelatedLocation {
            file: fallback.file.clone(),
            line: fallback.line,
            message: segment.to_string(),
        })
    }
}

/// Per-job diagnostics keyed by resolved file. Each publish replaces the whole
/// set; nothing accumulates across jobs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiagnosticCollection {
    entries: BTreeMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn replace(&mut self, diagnostics: Vec<Diagnostic>) {
        self.entries = group_by_file(diagnostics);
    }

    pub fn get(&self, file: &Path) -> &[Diagnostic] {
        self.entries.get(file).map_or(&[], Vec::as_slice)
    }

    pub fn files(&self) -> impl Iterator<Item = (&Path, &[Diagnostic])> {
        self.entries
            .iter()
            .map(|(file, diagnostics)| (file.as_path(), diagnostics.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .values()
            .map(|diagnostics| error_count(diagnostics))
            .sum()
    }
}

pub fn group_by_file(diagnostics: Vec<Diagnostic>) -> BTreeMap<PathBuf, Vec<Diagnostic>> {
    let mut grouped: BTreeMap<PathBuf, Vec<Diagnostic>> = BTreeMap::new();
    for diagnostic in diagnostics {
        grouped
            .entry(diagnostic.location.file.clone())
            .or_default()
            .push(diagnostic);
    }
    grouped
}
