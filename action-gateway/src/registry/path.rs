use std::fmt;

use crate::error::ValidationError;
use crate::json_ext::Object;
use crate::json_ext::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A REST path pattern such as `/users/:id/posts`.
///
/// A trailing slash is ignored. Named segments capture one percent-decoded path segment.
#[derive(Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, ValidationError> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(ValidationError::new("path", "must start with '/'"));
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let mut segments = Vec::new();
        if !rest.is_empty() {
            for segment in rest.split('/') {
                if segment.is_empty() {
                    return Err(ValidationError::new(
                        "path",
                        format!("'{pattern}' contains an empty segment"),
                    ));
                }
                match segment.strip_prefix(':') {
                    Some(name) => {
                        if name.is_empty()
                            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                        {
                            return Err(ValidationError::new(
                                "path",
                                format!("invalid parameter name ':{name}' in '{pattern}'"),
                            ));
                        }
                        if segments
                            .iter()
                            .any(|existing| *existing == Segment::Param(name.to_string()))
                        {
                            return Err(ValidationError::new(
                                "path",
                                format!("parameter ':{name}' is declared twice in '{pattern}'"),
                            ));
                        }
                        segments.push(Segment::Param(name.to_string()));
                    }
                    None if segment.contains(['*', '?', '#']) => {
                        return Err(ValidationError::new(
                            "path",
                            format!("unsupported character in segment '{segment}' of '{pattern}'"),
                        ));
                    }
                    None => segments.push(Segment::Literal(segment.to_string())),
                }
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The pattern with parameter names erased. Two patterns with the same shape claim the
    /// same concrete paths.
    pub fn shape(&self) -> String {
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(literal) => shape.push_str(literal),
                Segment::Param(_) => shape.push(':'),
            }
        }
        if shape.is_empty() {
            shape.push('/');
        }
        shape
    }

    /// Literal positions, used to prefer `/users/me` over `/users/:id`.
    pub(crate) fn precedence(&self) -> Vec<bool> {
        self.segments
            .iter()
            .map(|segment| matches!(segment, Segment::Literal(_)))
            .collect()
    }

    /// Matches a request path, returning the captured parameters.
    pub fn matches(&self, path: &str) -> Option<Object> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        let parts: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').collect()
        };
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = Object::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            let decoded = urlencoding::decode(part).ok()?;
            match segment {
                Segment::Literal(literal) if *literal == decoded => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), Value::String(decoded.into_owned()));
                }
            }
        }
        Some(params)
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathPattern").field(&self.source).finish()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
