// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graph resource name resolution.
//!
//! - `/abs/name` is kept as-is
//! - `~private` resolves under the node name
//! - `relative` resolves under the node namespace

use crate::error::{Error, Result};

/// Collapse repeated slashes and drop a trailing one (except for `/`).
pub fn clean(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_slash = false;
    for c in name.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Check that `name` only uses legal characters.
pub fn validate(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("empty name".into()));
    }
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !(first.is_ascii_alphabetic() || first == '/' || first == '~' || first == '_') {
            return Err(Error::InvalidName(name.to_string()));
        }
    }
    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '/')) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Join a namespace and a name.
pub fn append(left: &str, right: &str) -> String {
    clean(&format!("{}/{}", left, right))
}

/// Resolve `name` against the namespace and node name.
pub fn resolve(namespace: &str, node_name: &str, name: &str) -> Result<String> {
    validate(name)?;
    let resolved = if name.starts_with('/') {
        clean(name)
    } else if let Some(private) = name.strip_prefix('~') {
        append(node_name, private)
    } else {
        append(&format!("/{}", namespace), name)
    };
    Ok(resolved)
}

/// Namespace part of a resolved name (`/a/b/c` -> `/a/b`).
pub fn parent_namespace(name: &str) -> String {
    let cleaned = clean(name);
    match cleaned.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("//a//b/"), "/a/b");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn test_resolve_variants() {
        assert_eq!(resolve("/", "/talker", "/chatter").unwrap(), "/chatter");
        assert_eq!(resolve("/", "/talker", "chatter").unwrap(), "/chatter");
        assert_eq!(resolve("/ns", "/ns/talker", "chatter").unwrap(), "/ns/chatter");
        assert_eq!(
            resolve("/ns", "/ns/talker", "~rate").unwrap(),
            "/ns/talker/rate"
        );
    }

    #[test]
    fn test_validate_rejects_bad_chars() {
        assert!(validate("").is_err());
        assert!(validate("a b").is_err());
        assert!(validate("1abc").is_err());
        assert!(validate("/ok_name/x1").is_ok());
    }

    #[test]
    fn test_parent_namespace() {
        assert_eq!(parent_namespace("/a/b/c"), "/a/b");
        assert_eq!(parent_namespace("/node"), "/");
    }
}
