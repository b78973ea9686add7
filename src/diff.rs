//! Readable descriptions of where two byte streams diverge.
//!
//! Used by tests to report a mismatch between what a monitor was fed and
//! what it wrote. The common prefix and suffix are skipped; the differing
//! middle is aligned on its longest common subsequence when it is small
//! enough, otherwise reported as a single replacement.

use std::fmt::Write as _;
use std::ops::Range;

/// Bytes shown per side of a single change.
const SHOW_BYTES: usize = 16;

/// Changes listed before the rest are summarized.
const SHOW_CHANGES: usize = 16;

/// Largest middle section (in table cells) aligned byte by byte.
const MAX_ALIGN_CELLS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

/// One change turning `expected[expected]` into `actual[actual]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub kind: EditKind,
    pub expected: Range<usize>,
    pub actual: Range<usize>,
}

/// Edit script from `expected` to `actual`, in stream order.
///
/// Empty when the streams are equal.
pub fn diff_bytes(expected: &[u8], actual: &[u8]) -> Vec<Edit> {
    let prefix = expected
        .iter()
        .zip(actual)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = expected[prefix..]
        .iter()
        .rev()
        .zip(actual[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let a = &expected[prefix..expected.len() - suffix];
    let b = &actual[prefix..actual.len() - suffix];
    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }

    let cells = (a.len() + 1).saturating_mul(b.len() + 1);
    let mut edits = if a.is_empty() || b.is_empty() || cells > MAX_ALIGN_CELLS {
        vec![edit(0..a.len(), 0..b.len())]
    } else {
        align(a, b)
    };
    for e in &mut edits {
        e.expected = e.expected.start + prefix..e.expected.end + prefix;
        e.actual = e.actual.start + prefix..e.actual.end + prefix;
    }
    edits
}

/// Human-readable difference, or `None` when the streams are equal.
pub fn describe_difference(expected: &[u8], actual: &[u8]) -> Option<String> {
    let edits = diff_bytes(expected, actual);
    if edits.is_empty() {
        return None;
    }

    let mut out = format!(
        "byte streams differ (expected {} bytes, got {}):\n",
        expected.len(),
        actual.len()
    );
    for e in edits.iter().take(SHOW_CHANGES) {
        let removed = &expected[e.expected.clone()];
        let added = &actual[e.actual.clone()];
        let _ = match e.kind {
            EditKind::Insert => writeln!(
                out,
                "  at {} insert {}: {}",
                e.expected.start,
                added.len(),
                excerpt(added)
            ),
            EditKind::Delete => writeln!(
                out,
                "  at {} delete {}: {}",
                e.expected.start,
                removed.len(),
                excerpt(removed)
            ),
            EditKind::Replace => writeln!(
                out,
                "  at {} replace {} with {}:\n    -{}\n    +{}",
                e.expected.start,
                removed.len(),
                added.len(),
                excerpt(removed),
                excerpt(added)
            ),
        };
    }
    if edits.len() > SHOW_CHANGES {
        let _ = writeln!(out, "  ... and {} more", edits.len() - SHOW_CHANGES);
    }
    Some(out)
}

/// Panic with a description of the difference if the streams differ.
#[track_caller]
pub fn assert_bytes_eq(expected: &[u8], actual: &[u8]) {
    if let Some(description) = describe_difference(expected, actual) {
        panic!("{description}");
    }
}

fn edit(expected: Range<usize>, actual: Range<usize>) -> Edit {
    let kind = match (expected.is_empty(), actual.is_empty()) {
        (true, _) => EditKind::Insert,
        (_, true) => EditKind::Delete,
        _ => EditKind::Replace,
    };
    Edit {
        kind,
        expected,
        actual,
    }
}

fn excerpt(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(SHOW_BYTES * 3 + 4);
    for (i, b) in bytes.iter().take(SHOW_BYTES).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    if bytes.len() > SHOW_BYTES {
        out.push_str(" ...");
    }
    out
}

/// Longest-common-subsequence alignment of two non-empty slices.
fn align(a: &[u8], b: &[u8]) -> Vec<Edit> {
    let width = b.len() + 1;
    // lcs[i * width + j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![0u32; (a.len() + 1) * width];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i * width + j] = if a[i] == b[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut edits = Vec::new();
    let (mut i, mut j) = (0, 0);
    let mut run: Option<(usize, usize)> = None;
    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            if let Some((si, sj)) = run.take() {
                edits.push(edit(si..i, sj..j));
            }
            i += 1;
            j += 1;
            continue;
        }
        run.get_or_insert((i, j));
        if j == b.len() || (i < a.len() && lcs[(i + 1) * width + j] >= lcs[i * width + j + 1]) {
            i += 1;
        } else {
            j += 1;
        }
    }
    if let Some((si, sj)) = run {
        edits.push(edit(si..i, sj..j));
    }
    edits
}
