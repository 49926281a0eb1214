//! Cache key generation utilities.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Resolve `${{ hashFiles('a', 'b') }}` placeholders in a key template
/// against file contents under `base`.
///
/// Missing files contribute nothing to the digest; an entirely missing file
/// set still yields a stable digest of the empty input.
pub fn resolve_key(template: &str, base: &Path) -> String {
    let re = Regex::new(r"\$\{\{\s*hashFiles\(([^)]*)\)\s*\}\}").unwrap();

    re.replace_all(template, |caps: &regex::Captures| {
        let args = caps.get(1).map_or("", |m| m.as_str());
        let files: Vec<&str> = args
            .split(',')
            .map(|a| a.trim().trim_matches('\''))
            .filter(|a| !a.is_empty())
            .collect();
        hash_files(base, &files)
    })
    .to_string()
}

/// Content digest over an ordered set of input files, shortened to 16 hex
/// characters the way cache keys conventionally are.
pub fn hash_files(base: &Path, files: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.as_bytes());
        if let Ok(contents) = std::fs::read(base.join(file)) {
            hasher.update(&contents);
        }
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}
