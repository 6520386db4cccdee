use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Protocol a parameter mapping is compiled for. It decides which roots exist and the fixed
/// priority between source kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Rest,
    GraphQL,
}

/// Where a value is extracted from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Context,
    Path,
    Body,
    Query,
    FieldArgument,
    SourceObject,
}

impl SourceKind {
    /// Position in the fixed priority order of `protocol`, lower wins.
    pub(crate) fn rank(self, protocol: Protocol) -> usize {
        match (protocol, self) {
            (Protocol::Rest, SourceKind::Context) => 0,
            (Protocol::Rest, SourceKind::Path) => 1,
            (Protocol::Rest, SourceKind::Body) => 2,
            (Protocol::Rest, SourceKind::Query) => 3,
            (Protocol::GraphQL, SourceKind::Context) => 0,
            (Protocol::GraphQL, SourceKind::FieldArgument) => 1,
            (Protocol::GraphQL, SourceKind::SourceObject) => 2,
            _ => usize::MAX,
        }
    }

    /// Kinds tried for an implicit same-name match, highest priority first.
    pub(crate) fn implicit(protocol: Protocol) -> &'static [SourceKind] {
        match protocol {
            Protocol::Rest => &[SourceKind::Path, SourceKind::Body, SourceKind::Query],
            Protocol::GraphQL => &[
                SourceKind::Context,
                SourceKind::FieldArgument,
                SourceKind::SourceObject,
            ],
        }
    }
}

/// Type cast applied to a resolved string value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cast {
    Number,
    Boolean,
    /// Renders numbers and booleans as strings.
    String,
}

impl Cast {
    /// Casts `value`. `None` means the value cannot be cast.
    ///
    /// `Number` and `Boolean` only touch strings; any other value is returned unchanged.
    pub fn apply(self, value: Value) -> Option<Value> {
        match (self, value) {
            (Cast::Number, Value::String(text)) => {
                let text = text.trim();
                if let Ok(integer) = text.parse::<i64>() {
                    Some(Value::from(integer))
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                }
            }
            (Cast::Boolean, Value::String(text)) => {
                match text.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
                    "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
                    _ => None,
                }
            }
            (Cast::String, Value::Number(number)) => Some(Value::String(number.to_string())),
            (Cast::String, Value::Bool(boolean)) => Some(Value::String(boolean.to_string())),
            (_, value) => Some(value),
        }
    }
}

impl FromStr for Cast {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "number" => Ok(Cast::Number),
            "boolean" => Ok(Cast::Boolean),
            "string" => Ok(Cast::String),
            other => Err(format!("unknown cast ':{other}'")),
        }
    }
}

impl fmt::Display for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cast::Number => "number",
            Cast::Boolean => "boolean",
            Cast::String => "string",
        })
    }
}

/// One extraction: a root, a path below it and an optional cast.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueSource {
    pub kind: SourceKind,
    pub path: Path,
    pub cast: Option<Cast>,
}

/// Root markers, longest first so that `$path` is not read as `$` followed by `path`.
const ROOTS: [&str; 6] = ["$path", "$body", "$query", "$", "@", "#"];

/// True when `text` looks like a value source expression rather than a literal.
pub(crate) fn is_expression(text: &str) -> bool {
    text.starts_with(['$', '@', '#'])
}

/// Parses an expression such as `$.id:number`, `@.filter` or `#.principal.id`.
///
/// The `$` root of REST mappings expands to the path, body and query sources in that order.
pub(crate) fn parse_expression(
    expression: &str,
    protocol: Protocol,
) -> Result<Vec<ValueSource>, ValidationError> {
    let (root, rest) = ROOTS
        .iter()
        .find_map(|root| {
            expression
                .strip_prefix(*root)
                .filter(|rest| rest.is_empty() || rest.starts_with(['.', ':']))
                .map(|rest| (*root, rest))
        })
        .ok_or_else(|| {
            ValidationError::new("", format!("'{expression}' does not start with a known root"))
        })?;

    let kinds: &[SourceKind] = match (root, protocol) {
        ("$path", Protocol::Rest) => &[SourceKind::Path],
        ("$body", Protocol::Rest) => &[SourceKind::Body],
        ("$query", Protocol::Rest) => &[SourceKind::Query],
        ("$", Protocol::Rest) => &[SourceKind::Path, SourceKind::Body, SourceKind::Query],
        ("$", Protocol::GraphQL) => &[SourceKind::SourceObject],
        ("@", Protocol::GraphQL) => &[SourceKind::FieldArgument],
        ("#", _) => &[SourceKind::Context],
        (root, protocol) => {
            return Err(ValidationError::new(
                "",
                format!("root '{root}' of '{expression}' is not available for {protocol:?}"),
            ));
        }
    };

    let (path, cast) = match rest.rsplit_once(':') {
        Some((path, cast)) => (
            path,
            Some(
                cast.parse::<Cast>()
                    .map_err(|reason| ValidationError::new("", reason))?,
            ),
        ),
        None => (rest, None),
    };

    let path = match path.strip_prefix('.') {
        None if path.is_empty() => Path::empty(),
        Some(dotted) if !dotted.is_empty() && !dotted.split('.').any(str::is_empty) => {
            Path::from_dotted(dotted)
        }
        _ => {
            return Err(ValidationError::new(
                "",
                format!("malformed extraction path in '{expression}'"),
            ));
        }
    };

    Ok(kinds
        .iter()
        .map(|kind| ValueSource {
            kind: *kind,
            path: path.clone(),
            cast,
        })
        .collect())
}
