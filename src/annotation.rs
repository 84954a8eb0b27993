//! Script metadata annotations
//!
//! Scripts describe themselves in comment lines. Each annotation starts with
//! `# wps.<kind>:` and runs until an unquoted `;`, possibly across several
//! comment lines:
//!
//! ```text
//! # wps.des: id = uniform, title = Random numbers,
//! #   abstract = "Draws n values, scaled by x";
//! # wps.in: x, double, title = Scale, minOccurs = 1, maxOccurs = 1, value = 1;
//! # wps.out: y, double;
//! # wps.resource: lookup.csv, shapes/region.shp;
//! # wps.import: helpers.R;
//! # wps.metadata: title = Documentation, href = https://example.org/uniform;
//! ```
//!
//! In `wps.des` the first positional item is the identifier; in `wps.in` and
//! `wps.out` the first two are identifier and type. Resource and import
//! annotations are plain ordered lists.

use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Errors raised while reading annotations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: script is not valid UTF-8")]
    InvalidUtf8 { line: usize },

    #[error("line {line}: {kind} annotation is not terminated with ';'")]
    Unterminated { line: usize, kind: AnnotationType },

    #[error("line {line}: unclosed quote in {kind} annotation")]
    UnclosedQuote { line: usize, kind: AnnotationType },

    #[error("line {line}: unknown annotation 'wps.{name}'")]
    UnknownAnnotation { line: usize, name: String },

    #[error("line {line}: attribute '{key}' is not allowed in {kind}")]
    UnknownAttribute {
        line: usize,
        kind: AnnotationType,
        key: String,
    },

    #[error("line {line}: attribute '{key}' given twice")]
    DuplicateAttribute { line: usize, key: Attribute },

    #[error("line {line}: '{key}' must be a non-negative integer, got '{value}'")]
    InvalidInteger {
        line: usize,
        key: Attribute,
        value: String,
    },

    #[error("line {line}: unexpected value '{value}' in {kind}")]
    UnexpectedPositional {
        line: usize,
        kind: AnnotationType,
        value: String,
    },

    #[error("line {line}: {kind} annotation is empty")]
    Empty { line: usize, kind: AnnotationType },
}

impl ParseError {
    /// Script line the offending annotation starts on (1-based)
    pub fn line(&self) -> usize {
        match self {
            Self::InvalidUtf8 { line }
            | Self::Unterminated { line, .. }
            | Self::UnclosedQuote { line, .. }
            | Self::UnknownAnnotation { line, .. }
            | Self::UnknownAttribute { line, .. }
            | Self::DuplicateAttribute { line, .. }
            | Self::InvalidInteger { line, .. }
            | Self::UnexpectedPositional { line, .. }
            | Self::Empty { line, .. } => *line,
        }
    }
}

/// Annotation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationType {
    #[strum(to_string = "wps.des", serialize = "des")]
    Description,
    #[strum(to_string = "wps.in", serialize = "in")]
    Input,
    #[strum(to_string = "wps.out", serialize = "out")]
    Output,
    #[strum(to_string = "wps.resource", serialize = "resource")]
    Resource,
    #[strum(to_string = "wps.import", serialize = "import")]
    Import,
    #[strum(to_string = "wps.metadata", serialize = "metadata")]
    Metadata,
}

impl AnnotationType {
    /// Attribute keys accepted in `key = value` form
    pub fn allowed_keys(self) -> &'static [Attribute] {
        use Attribute::*;
        match self {
            Self::Description => &[Id, Title, Abstract, Version, Author],
            Self::Input => &[Id, Type, Title, Abstract, MinOccurs, MaxOccurs, Value],
            Self::Output => &[Id, Type, Title, Abstract],
            Self::Metadata => &[Title, Href],
            Self::Resource | Self::Import => &[],
        }
    }

    /// Attributes filled from leading positional items
    fn positional_keys(self) -> &'static [Attribute] {
        match self {
            Self::Description => &[Attribute::Id],
            Self::Input | Self::Output => &[Attribute::Id, Attribute::Type],
            _ => &[],
        }
    }

    fn is_list(self) -> bool {
        matches!(self, Self::Resource | Self::Import)
    }
}

/// Attribute keys, parsed case-insensitively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase")]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "camelCase")]
pub enum Attribute {
    #[strum(to_string = "id", serialize = "identifier")]
    Id,
    Type,
    Title,
    Abstract,
    MinOccurs,
    MaxOccurs,
    /// Default value of an input
    Value,
    Version,
    Author,
    Href,
    /// Ordered entries of a resource or import annotation
    #[strum(to_string = "entries")]
    NamedList,
}

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Integer(u32),
    List(Vec<String>),
}

/// One parsed annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub kind: AnnotationType,
    pub attributes: BTreeMap<Attribute, AttributeValue>,
    /// Line the annotation starts on (1-based)
    pub line: usize,
}

impl Annotation {
    pub fn get(&self, key: Attribute) -> Option<&AttributeValue> {
        self.attributes.get(&key)
    }

    pub fn text(&self, key: Attribute) -> Option<&str> {
        match self.attributes.get(&key)? {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, key: Attribute) -> Option<u32> {
        match self.attributes.get(&key)? {
            AttributeValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Entries of a resource or import annotation
    pub fn list(&self) -> &[String] {
        match self.attributes.get(&Attribute::NamedList) {
            Some(AttributeValue::List(items)) => items,
            _ => &[],
        }
    }
}

/// Turns script bytes into annotations
pub trait MetadataParser: Send + Sync {
    fn parse(&self, script: &[u8]) -> Result<Vec<Annotation>, ParseError>;
}

/// Parser for the `# wps.<kind>:` comment syntax
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotationParser;

impl MetadataParser for AnnotationParser {
    fn parse(&self, script: &[u8]) -> Result<Vec<Annotation>, ParseError> {
        let text = std::str::from_utf8(script).map_err(|e| ParseError::InvalidUtf8 {
            line: script[..e.valid_up_to()].iter().filter(|b| **b == b'\n').count() + 1,
        })?;

        let mut annotations = Vec::new();
        // (kind, start line, accumulated body)
        let mut open: Option<(AnnotationType, usize, String)> = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let Some(comment) = raw.trim_start().strip_prefix('#') else {
                if let Some((kind, line, _)) = open {
                    return Err(ParseError::Unterminated { line, kind });
                }
                continue;
            };

            let (kind, line, mut body) = match open.take() {
                Some((kind, line, mut body)) => {
                    body.push(' ');
                    body.push_str(comment.trim());
                    (kind, line, body)
                }
                None => match start_of_annotation(comment, line_no)? {
                    Some((kind, rest)) => (kind, line_no, rest.trim().to_string()),
                    None => continue,
                },
            };

            match terminator(&body) {
                Some(end) => {
                    body.truncate(end);
                    annotations.push(build(kind, line, &body)?);
                }
                None => open = Some((kind, line, body)),
            }
        }

        if let Some((kind, line, body)) = open {
            return Err(if has_unclosed_quote(&body) {
                ParseError::UnclosedQuote { line, kind }
            } else {
                ParseError::Unterminated { line, kind }
            });
        }
        Ok(annotations)
    }
}

/// Recognise `wps.<kind>:` at the start of a comment body
fn start_of_annotation(
    comment: &str,
    line: usize,
) -> Result<Option<(AnnotationType, &str)>, ParseError> {
    let Some(rest) = comment.trim_start().strip_prefix("wps.") else {
        return Ok(None);
    };
    let Some((name, body)) = rest.split_once(':') else {
        return Ok(None);
    };
    let name = name.trim();
    AnnotationType::from_str(name)
        .map(|kind| Some((kind, body)))
        .map_err(|_| ParseError::UnknownAnnotation {
            line,
            name: name.to_string(),
        })
}

/// Byte offset of the first unquoted `;`
fn terminator(body: &str) -> Option<usize> {
    let mut quoted = false;
    for (i, c) in body.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ';' if !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

fn has_unclosed_quote(body: &str) -> bool {
    body.chars().filter(|c| *c == '"').count() % 2 == 1
}

/// Split on unquoted commas, trimming items and dropping empty ones
fn split_items(body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in body.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Split `key = value` on the first unquoted `=`
fn split_pair(item: &str) -> Option<(&str, &str)> {
    let mut quoted = false;
    for (i, c) in item.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '=' if !quoted => return Some((item[..i].trim(), item[i + 1..].trim())),
            _ => {}
        }
    }
    None
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn build(kind: AnnotationType, line: usize, body: &str) -> Result<Annotation, ParseError> {
    let items = split_items(body);
    if items.is_empty() {
        return Err(ParseError::Empty { line, kind });
    }

    let mut attributes = BTreeMap::new();
    if kind.is_list() {
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            if split_pair(&item).is_some() {
                return Err(ParseError::UnexpectedPositional {
                    line,
                    kind,
                    value: item,
                });
            }
            entries.push(unquote(&item));
        }
        attributes.insert(Attribute::NamedList, AttributeValue::List(entries));
        return Ok(Annotation {
            kind,
            attributes,
            line,
        });
    }

    let mut positional = kind.positional_keys().iter();
    for item in items {
        let (key, raw) = match split_pair(&item) {
            Some((key, raw)) => {
                let key = Attribute::from_str(key)
                    .ok()
                    .filter(|k| kind.allowed_keys().contains(k))
                    .ok_or_else(|| ParseError::UnknownAttribute {
                        line,
                        kind,
                        key: key.to_string(),
                    })?;
                (key, raw.to_string())
            }
            None => match positional.next() {
                Some(key) => (*key, item.clone()),
                None => {
                    return Err(ParseError::UnexpectedPositional {
                        line,
                        kind,
                        value: item,
                    });
                }
            },
        };

        let value = match key {
            Attribute::MinOccurs | Attribute::MaxOccurs => {
                let text = unquote(&raw);
                AttributeValue::Integer(text.parse().map_err(|_| ParseError::InvalidInteger {
                    line,
                    key,
                    value: text.clone(),
                })?)
            }
            _ => AttributeValue::Text(unquote(&raw)),
        };
        if attributes.insert(key, value).is_some() {
            return Err(ParseError::DuplicateAttribute { line, key });
        }
    }

    Ok(Annotation {
        kind,
        attributes,
        line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(script: &str) -> Result<Vec<Annotation>, ParseError> {
        AnnotationParser.parse(script.as_bytes())
    }

    // =========================================================================
    // Single-line annotations
    // =========================================================================

    #[test]
    fn test_parse_full_script() {
        let script = "\
# wps.des: uniform, title = Random numbers, abstract = test;
# wps.in: x, double, minOccurs = 0, maxOccurs = 1, value = 2;
# wps.out: y, double;
# wps.resource: a.txt, dir/b.png;
# wps.import: helpers.R;
y <- x * 2
";
        let annotations = parse(script).unwrap();
        assert_eq!(annotations.len(), 5);

        let des = &annotations[0];
        assert_eq!(des.kind, AnnotationType::Description);
        assert_eq!(des.text(Attribute::Id), Some("uniform"));
        assert_eq!(des.text(Attribute::Title), Some("Random numbers"));

        let input = &annotations[1];
        assert_eq!(input.text(Attribute::Id), Some("x"));
        assert_eq!(input.text(Attribute::Type), Some("double"));
        assert_eq!(input.integer(Attribute::MinOccurs), Some(0));
        assert_eq!(input.text(Attribute::Value), Some("2"));
        assert_eq!(input.line, 2);

        assert_eq!(annotations[3].list(), ["a.txt", "dir/b.png"]);
        assert_eq!(annotations[4].kind, AnnotationType::Import);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let annotations = parse("# wps.in: id = x, TYPE = integer, MINOCCURS = 2;").unwrap();
        assert_eq!(annotations[0].integer(Attribute::MinOccurs), Some(2));
        assert_eq!(annotations[0].text(Attribute::Type), Some("integer"));
    }

    #[test]
    fn test_plain_comments_and_code_ignored() {
        let annotations = parse("# just a comment\nx <- 1 # wps.in: x;\n#wps: nothing\n").unwrap();
        assert!(annotations.is_empty());
    }

    // =========================================================================
    // Quoting and continuation
    // =========================================================================

    #[test]
    fn test_quoted_values_keep_separators() {
        let annotations =
            parse("# wps.des: id = q, abstract = \"a, b = c; d\";").unwrap();
        assert_eq!(annotations[0].text(Attribute::Abstract), Some("a, b = c; d"));
    }

    #[test]
    fn test_multi_line_annotation() {
        let script = "# wps.des: id = multi,\n#   title = Spread out,\n#   abstract = over lines;\nx <- 1\n";
        let annotations = parse(script).unwrap();
        assert_eq!(annotations[0].text(Attribute::Abstract), Some("over lines"));
        assert_eq!(annotations[0].line, 1);
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn test_unterminated_before_code() {
        let err = parse("# wps.out: y, double\ny <- 1\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::Unterminated {
                line: 1,
                kind: AnnotationType::Output
            }
        );
    }

    #[test]
    fn test_unterminated_at_end_of_file() {
        let err = parse("x <- 1\n# wps.des: id = x").unwrap_err();
        assert_eq!(err.line(), 2);
        assert!(matches!(err, ParseError::Unterminated { .. }));

        let err = parse("# wps.des: id = x, title = \"open;").unwrap_err();
        assert!(matches!(err, ParseError::UnclosedQuote { .. }));
    }

    #[test]
    fn test_unknown_attribute_and_annotation() {
        let err = parse("# wps.out: y, double, minOccurs = 1;").unwrap_err();
        assert!(matches!(err, ParseError::UnknownAttribute { .. }));

        let err = parse("# wps.in: x, double, colour = red;").unwrap_err();
        assert!(err.to_string().contains("colour"));

        let err = parse("# wps.output: y;").unwrap_err();
        assert!(matches!(err, ParseError::UnknownAnnotation { .. }));
    }

    #[test]
    fn test_invalid_occurrence_bound() {
        let err = parse("# wps.in: x, double, maxOccurs = many;").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidInteger {
                line: 1,
                key: Attribute::MaxOccurs,
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn test_extra_positional_and_duplicates() {
        let err = parse("# wps.out: y, double, extra;").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedPositional { .. }));

        let err = parse("# wps.in: x, double, id = z;").unwrap_err();
        assert!(matches!(err, ParseError::DuplicateAttribute { .. }));

        let err = parse("# wps.resource: a = b;").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedPositional { .. }));

        let err = parse("# wps.import: ;").unwrap_err();
        assert!(matches!(err, ParseError::Empty { .. }));
    }

    #[test]
    fn test_invalid_utf8_reports_line() {
        let mut bytes = b"# ok\n# wps.des: id = x;\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        let err = AnnotationParser.parse(&bytes).unwrap_err();
        assert_eq!(err, ParseError::InvalidUtf8 { line: 3 });
    }

    #[test]
    fn test_attribute_display() {
        assert_eq!(Attribute::MinOccurs.to_string(), "minOccurs");
        assert_eq!(Attribute::Id.to_string(), "id");
        assert_eq!(AnnotationType::Input.to_string(), "wps.in");
    }
}
