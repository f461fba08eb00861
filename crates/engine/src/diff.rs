//! Diff generator: old/new text in, minimal operation list out.
//!
//! Runs entirely on the authoring side before transmission. Common prefix
//! and suffix are trimmed first, then an LCS opcode scan over the remaining
//! characters turns each non-equal region into one delete and/or insert
//! (delete-then-insert at the same position for a replace region). The scan
//! is deterministic: equal-cost choices always prefer consuming old text
//! first.

use crate::operation::Operation;

/// Middles larger than this (product of character counts) skip the LCS table
/// and fall back to a single replace region. Still deterministic.
const LCS_CELL_LIMIT: usize = 1 << 22;

/// Compute the operations that turn `old` into `new`.
///
/// Applying the returned operations to `old` in order yields `new`. Each
/// operation gets a fresh, strictly-increasing timestamp, so a batch sorted
/// by timestamp replays in generation order.
pub fn diff(old: &str, new: &str) -> Vec<Operation> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix = 0;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old_chars[prefix..old_chars.len() - suffix];
    let new_mid = &new_chars[prefix..new_chars.len() - suffix];

    let mut ops = Vec::new();
    for region in regions(old_mid, new_mid) {
        let (line, ch) = position_at(&new_chars, prefix + region.new_start);
        if region.old_end > region.old_start {
            let deleted: String = old_mid[region.old_start..region.old_end].iter().collect();
            ops.push(Operation::delete(deleted, line, ch));
        }
        if region.new_end > region.new_start {
            let inserted: String = new_mid[region.new_start..region.new_end].iter().collect();
            ops.push(Operation::insert(inserted, line, ch));
        }
    }
    ops
}

/// One maximal non-equal region of the trimmed middles.
struct Region {
    old_start: usize,
    old_end: usize,
    new_start: usize,
    new_end: usize,
}

/// Non-equal regions of `a` → `b`, in order, via an LCS opcode walk.
fn regions(a: &[char], b: &[char]) -> Vec<Region> {
    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }
    if a.is_empty() || b.is_empty() || a.len().saturating_mul(b.len()) > LCS_CELL_LIMIT {
        return vec![Region {
            old_start: 0,
            old_end: a.len(),
            new_start: 0,
            new_end: b.len(),
        }];
    }

    // dp[i][j] = LCS length of a[i..] and b[j..].
    let (n, m) = (a.len(), b.len());
    let mut dp = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if a[i] == b[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    let (mut region_i, mut region_j) = (0, 0);
    let mut in_region = false;
    while i < n && j < m {
        if a[i] == b[j] {
            if in_region {
                out.push(Region {
                    old_start: region_i,
                    old_end: i,
                    new_start: region_j,
                    new_end: j,
                });
                in_region = false;
            }
            i += 1;
            j += 1;
        } else {
            if !in_region {
                region_i = i;
                region_j = j;
                in_region = true;
            }
            if dp[i + 1][j] >= dp[i][j + 1] {
                i += 1;
            } else {
                j += 1;
            }
        }
    }
    if i < n || j < m {
        if !in_region {
            region_i = i;
            region_j = j;
        }
        out.push(Region {
            old_start: region_i,
            old_end: n,
            new_start: region_j,
            new_end: m,
        });
    } else if in_region {
        out.push(Region {
            old_start: region_i,
            old_end: i,
            new_start: region_j,
            new_end: j,
        });
    }
    out
}

/// (line, char) of the character at absolute offset `offset` in `chars`.
fn position_at(chars: &[char], offset: usize) -> (usize, usize) {
    let mut line = 0;
    let mut ch = 0;
    for &c in &chars[..offset.min(chars.len())] {
        if c == '\n' {
            line += 1;
            ch = 0;
        } else {
            ch += 1;
        }
    }
    (line, ch)
}
