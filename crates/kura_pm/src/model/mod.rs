//! Coordinates, scopes and version ordering shared by every layer.

mod dependency;
mod scope;
mod version;

pub use dependency::{Dependency, DEFAULT_EXTENSION};
pub use scope::{Scope, ScopeParseError};
pub use version::{ArtifactVersion, sort_versions};

/// `*` を任意長ワイルドカードとして扱う簡易グロブ照合。
pub(crate) fn matches_pattern(text: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let mut remaining = text;
    let mut parts = pattern.split('*').peekable();

    if let Some(first) = parts.peek().copied() {
        if !pattern.starts_with('*') {
            if !remaining.starts_with(first) {
                return false;
            }
            remaining = &remaining[first.len()..];
            parts.next();
        }
    }

    while let Some(part) = parts.next() {
        if parts.peek().is_none() && !pattern.ends_with('*') {
            return remaining.ends_with(part);
        }

        if part.is_empty() {
            continue;
        }

        if let Some(index) = remaining.find(part) {
            remaining = &remaining[index + part.len()..];
        } else {
            return false;
        }
    }

    pattern.ends_with('*') || remaining.is_empty()
}
