//! YAML frontmatter parsing.
//!
//! A document may open with a block fenced by `---` lines. The block is
//! parsed as a YAML mapping and converted to JSON so it can be merged into
//! node metadata.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("invalid frontmatter YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("frontmatter is not a mapping")]
    NotMapping,

    #[error("frontmatter cannot be represented as JSON: {0}")]
    Unrepresentable(#[from] serde_json::Error),
}

/// A document split into its frontmatter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<'a> {
    pub frontmatter: Map<String, Value>,
    pub body: &'a str,
}

/// Split `content` into frontmatter and body.
///
/// Content without an opening `---` line has empty frontmatter and the
/// whole input as body. So does an opening `---` that is never closed: that
/// is a thematic break, not a frontmatter block.
pub fn parse(content: &str) -> Result<Parsed<'_>, FrontmatterError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let Some(rest) = strip_fence_line(content) else {
        return Ok(Parsed {
            frontmatter: Map::new(),
            body: content,
        });
    };

    // Find the closing fence on a line of its own.
    let mut offset = 0;
    let (yaml, body) = loop {
        let line_end = rest[offset..].find('\n').map(|i| offset + i + 1);
        let line = &rest[offset..line_end.unwrap_or(rest.len())];
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            break (&rest[..offset], &rest[line_end.unwrap_or(rest.len())..]);
        }
        match line_end {
            Some(next) => offset = next,
            None => {
                debug!("Opening --- never closed; treating it as body text");
                return Ok(Parsed {
                    frontmatter: Map::new(),
                    body: content,
                });
            }
        }
    };

    if yaml.trim().is_empty() {
        return Ok(Parsed {
            frontmatter: Map::new(),
            body,
        });
    }

    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let frontmatter = match serde_json::to_value(value)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(FrontmatterError::NotMapping),
    };

    Ok(Parsed { frontmatter, body })
}

fn strip_fence_line(content: &str) -> Option<&str> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.trim_start_matches([' ', '\t']);
    rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))
}

/// String form of a scalar frontmatter value.
pub fn get_string(frontmatter: &Map<String, Value>, key: &str) -> Option<String> {
    match frontmatter.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_frontmatter() {
        let parsed = parse("# Title\n\nBody").unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, "# Title\n\nBody");
    }

    #[test]
    fn test_basic_frontmatter() {
        let parsed = parse("---\ntitle: Hello\ntags: [a, b]\ndate: 2024-03-01\n---\n# Body\n").unwrap();
        assert_eq!(get_string(&parsed.frontmatter, "title").as_deref(), Some("Hello"));
        assert_eq!(get_string(&parsed.frontmatter, "date").as_deref(), Some("2024-03-01"));
        assert_eq!(parsed.frontmatter["tags"], serde_json::json!(["a", "b"]));
        assert_eq!(parsed.body, "# Body\n");
    }

    #[test]
    fn test_crlf_and_empty_block() {
        let parsed = parse("---\r\n---\r\nbody").unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, "body");
    }

    #[test]
    fn test_unclosed_fence_is_body() {
        let text = "---\n\n# Title\n\nbody after a thematic break";
        let parsed = parse(text).unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, text);
    }

    #[test]
    fn test_non_mapping_rejected() {
        assert!(matches!(
            parse("---\n- a\n- b\n---\n"),
            Err(FrontmatterError::NotMapping)
        ));
    }

    #[test]
    fn test_horizontal_rule_is_not_frontmatter() {
        let parsed = parse("----\ntext").unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, "----\ntext");
    }
}
