//! Statement sequencer
//!
//! Turns statement lists, descriptors and SQL scripts into an ordered
//! execution plan. Ordering is always the caller's: the sequencer never
//! reorders or infers dependencies.

use crate::migration::descriptor::MigrationDescriptor;
use crate::migration::models::Statement;
use std::collections::HashSet;

pub struct StatementSequencer;

impl StatementSequencer {
    /// The caller's list, unchanged
    pub fn sequence(statements: Vec<Statement>) -> Vec<Statement> {
        statements
    }

    /// Compile a descriptor into `disable → drop → create → enable`.
    ///
    /// Every created name is also dropped first, so re-running an applied
    /// descriptor leaves the policy set as it was.
    pub fn plan(descriptor: &MigrationDescriptor) -> Vec<Statement> {
        let table = &descriptor.table;
        let mut plan = Vec::with_capacity(descriptor.drop.len() + descriptor.create.len() * 2 + 2);

        plan.push(Statement::disable(table));

        let mut dropped = HashSet::new();
        let drops = descriptor
            .drop
            .iter()
            .chain(descriptor.create.iter().map(|p| &p.name));
        for name in drops {
            if dropped.insert(name.as_str()) {
                plan.push(Statement::drop_policy(table, name));
            }
        }

        plan.extend(descriptor.create.iter().map(|p| Statement::create_policy(table, p)));
        plan.push(Statement::enable(table));

        Self::sequence(plan)
    }

    /// Split a SQL script into statements on top-level semicolons.
    ///
    /// Semicolons inside string literals, quoted identifiers, dollar-quoted
    /// bodies and comments do not split.
    pub fn split_script(script: &str) -> Vec<Statement> {
        let bytes = script.as_bytes();
        let mut fragments = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'\'' | b'"' => i = skip_quoted(bytes, i),
                b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
                b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
                b'$' => i = skip_dollar_quoted(script, i),
                b';' => {
                    fragments.push(&script[start..i]);
                    start = i + 1;
                    i += 1;
                }
                _ => i += 1,
            }
        }
        fragments.push(&script[start..]);

        fragments
            .into_iter()
            .filter_map(|fragment| {
                let body = strip_leading_comments(fragment);
                if body.is_empty() {
                    None
                } else {
                    Some(Statement::raw(format!("{};", body)))
                }
            })
            .collect()
    }
}

/// Index just past the closing quote; doubled quotes are escapes
fn skip_quoted(bytes: &[u8], open: usize) -> usize {
    let quote = bytes[open];
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map_or(bytes.len(), |p| start + 2 + p + 2)
}

/// `$$ ... $$` or `$tag$ ... $tag$`; a bare `$1` parameter is skipped as one byte
fn skip_dollar_quoted(script: &str, open: usize) -> usize {
    let bytes = script.as_bytes();
    let mut j = open + 1;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }

    let tag_is_valid = j < bytes.len()
        && bytes[j] == b'$'
        && !bytes.get(open + 1).map_or(false, |b| b.is_ascii_digit());
    if !tag_is_valid {
        return open + 1;
    }

    let tag = &script[open..=j];
    match script[j + 1..].find(tag) {
        Some(p) => j + 1 + p + tag.len(),
        None => bytes.len(),
    }
}

/// Trimmed fragment without leading `--` lines or `/* */` blocks; empty when nothing else remains
fn strip_leading_comments(fragment: &str) -> &str {
    let mut rest = fragment.trim();
    loop {
        if rest.starts_with("--") {
            rest = match rest.find('\n') {
                Some(p) => rest[p + 1..].trim_start(),
                None => "",
            };
        } else if rest.starts_with("/*") {
            rest = match rest[2..].find("*/") {
                Some(p) => rest[2 + p + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest.trim_end();
        }
    }
}
