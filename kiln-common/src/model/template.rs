// kiln-common/src/model/template.rs
//! Placeholder expansion for strings in formula descriptions.
//!
//! `{key}` is replaced by whatever the resolver returns for `key`. `{key|default}` passes the
//! default along so the resolver can fall back to it. `{{` and `}}` produce literal braces.

use crate::error::{KilnError, Result};

pub fn expand<F>(input: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str, Option<&str>) -> Result<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &input[idx + 1..];
                let end = rest.find('}').ok_or_else(|| {
                    KilnError::Template(format!("Unclosed placeholder in '{input}'"))
                })?;
                let body = &rest[..end];
                if body.is_empty() {
                    return Err(KilnError::Template(format!(
                        "Empty placeholder in '{input}'"
                    )));
                }
                let (key, default) = match body.split_once('|') {
                    Some((key, default)) => (key, Some(default)),
                    None => (body, None),
                };
                out.push_str(&resolve(key.trim(), default)?);
                // Skip the placeholder body and the closing brace.
                for _ in 0..body.chars().count() + 1 {
                    chars.next();
                }
            }
            '}' => {
                return Err(KilnError::Template(format!(
                    "Unmatched '}}' in '{input}'"
                )));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Collects the placeholder keys referenced by `input`, in order of appearance. Fails on the
/// same malformed input `expand` rejects.
pub fn placeholders(input: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    expand(input, |key, _| {
        keys.push(key.to_string());
        Ok(String::new())
    })?;
    Ok(keys)
}
