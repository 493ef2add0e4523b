//! `#{name}` interpolation for argument templates.
//!
//! `##` is an escaped `#`; a `#` not followed by `{` is kept as-is.
//! Templates are split into argv with shell quoting rules *before*
//! substitution, so a value containing spaces stays a single argument.
//! A `#` never starts a comment.

use std::{borrow::Borrow, collections::HashMap, hash::Hash};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InterpError {
    #[error("Undefined variable '{0}' at {}", .1+1)]
    UndefinedVar(String, usize),

    #[error("Unclosed brace (found open brace at {})", .0+1)]
    UnclosedBrace(usize),

    #[error("Cannot split arguments: {0}")]
    Split(String),
}

pub fn interp<K, V>(fmt: &str, variables: &HashMap<K, V>) -> Result<String, InterpError>
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
{
    let mut out = String::with_capacity(fmt.len() + 16);
    let mut chars = fmt.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '#' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '#')) => {
                chars.next();
                out.push('#');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(InterpError::UnclosedBrace(i + 1));
                }
                let value = variables
                    .get(name.as_str())
                    .ok_or_else(|| InterpError::UndefinedVar(name.clone(), i + 2))?;
                out += value.as_ref();
            }
            _ => out.push('#'),
        }
    }
    Ok(out)
}

/// Splits `template` into words and interpolates each word.
pub fn interp_args<K, V>(template: &str, variables: &HashMap<K, V>) -> Result<Vec<String>, InterpError>
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
{
    shell_words::split(&escape_hashes(template))
        .map_err(|e| InterpError::Split(e.to_string()))?
        .iter()
        .map(|word| interp(word, variables))
        .collect()
}

/// Backslash-escapes every unquoted `#` so the splitter keeps it.
fn escape_hashes(template: &str) -> String {
    let mut out = String::with_capacity(template.len() + 8);
    let mut quote: Option<char> = None;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (None, '#') => out.push_str("\\#"),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (None | Some('"'), '\\') => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
