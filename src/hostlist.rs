//! Hostname range expressions
//!
//! Expands `n[0-3,8],login1` style expressions into node names and
//! compresses name lists back to the canonical ranged form. Zero padding is
//! preserved (`n[01-03]` expands to `n01..n03` and compresses back the same
//! way). Job records store their allocation both as a bitmap and as this
//! compact string.

use crate::error::{ControllerError, ControllerResult};
use std::collections::BTreeMap;

/// Expand a host expression into individual names, in expression order.
pub fn expand(expr: &str) -> ControllerResult<Vec<String>> {
    let mut names = Vec::new();
    for part in split_top_level(expr)? {
        expand_part(&part, &mut names)?;
    }
    if names.is_empty() {
        return Err(ControllerError::InvalidNodeList(expr.to_string()));
    }
    Ok(names)
}

/// Compress a list of names into the canonical ranged expression.
///
/// Names sharing a prefix and digit width are grouped; groups appear in
/// first-occurrence order, numbers ascending within a group.
pub fn compress(names: &[String]) -> String {
    // (prefix, width) -> sorted numbers; map keyed by insertion order.
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut groups: BTreeMap<(String, usize), Vec<u64>> = BTreeMap::new();
    let mut plain: Vec<String> = Vec::new();

    for name in names {
        match split_numeric_suffix(name) {
            Some((prefix, digits)) => {
                let key = (prefix.to_string(), digits.len());
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                if let Ok(n) = digits.parse::<u64>() {
                    groups.entry(key).or_default().push(n);
                } else {
                    plain.push(name.clone());
                }
            }
            None => plain.push(name.clone()),
        }
    }

    let mut out: Vec<String> = Vec::new();
    for key in order {
        let (prefix, width) = &key;
        let mut nums = match groups.remove(&key) {
            Some(v) => v,
            None => continue,
        };
        nums.sort_unstable();
        nums.dedup();
        if nums.len() == 1 {
            out.push(format!("{prefix}{:0width$}", nums[0], width = *width));
            continue;
        }
        let mut ranges: Vec<String> = Vec::new();
        let mut start = nums[0];
        let mut prev = nums[0];
        for &n in &nums[1..] {
            if n == prev + 1 {
                prev = n;
                continue;
            }
            ranges.push(format_range(start, prev, *width));
            start = n;
            prev = n;
        }
        ranges.push(format_range(start, prev, *width));
        out.push(format!("{prefix}[{}]", ranges.join(",")));
    }
    out.extend(plain);
    out.join(",")
}

fn format_range(start: u64, end: u64, width: usize) -> String {
    if start == end {
        format!("{start:0width$}")
    } else {
        format!("{start:0width$}-{end:0width$}")
    }
}

/// Split on commas that are not inside brackets.
fn split_top_level(expr: &str) -> ControllerResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for ch in expr.chars() {
        match ch {
            '[' => {
                depth += 1;
                if depth > 1 {
                    return Err(ControllerError::InvalidNodeList(expr.to_string()));
                }
                cur.push(ch);
            }
            ']' => {
                if depth == 0 {
                    return Err(ControllerError::InvalidNodeList(expr.to_string()));
                }
                depth -= 1;
                cur.push(ch);
            }
            ',' if depth == 0 => {
                if !cur.is_empty() {
                    parts.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(ch),
        }
    }
    if depth != 0 {
        return Err(ControllerError::InvalidNodeList(expr.to_string()));
    }
    if !cur.is_empty() {
        parts.push(cur);
    }
    Ok(parts)
}

fn expand_part(part: &str, names: &mut Vec<String>) -> ControllerResult<()> {
    let Some(open) = part.find('[') else {
        names.push(part.to_string());
        return Ok(());
    };
    let close = part
        .rfind(']')
        .ok_or_else(|| ControllerError::InvalidNodeList(part.to_string()))?;
    if close != part.len() - 1 || close <= open {
        return Err(ControllerError::InvalidNodeList(part.to_string()));
    }
    let prefix = &part[..open];
    let ranges = &part[open + 1..close];
    for range in ranges.split(',') {
        let (lo, hi) = match range.split_once('-') {
            Some((a, b)) => (a, b),
            None => (range, range),
        };
        let width = lo.len();
        let start: u64 = lo
            .parse()
            .map_err(|_| ControllerError::InvalidNodeList(part.to_string()))?;
        let end: u64 = hi
            .parse()
            .map_err(|_| ControllerError::InvalidNodeList(part.to_string()))?;
        if end < start {
            return Err(ControllerError::InvalidNodeList(part.to_string()));
        }
        for n in start..=end {
            names.push(format!("{prefix}{n:0width$}"));
        }
    }
    Ok(())
}

/// Split a trailing all-digit suffix off a name.
fn split_numeric_suffix(name: &str) -> Option<(&str, &str)> {
    let split_at = name
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if split_at == name.len() {
        None
    } else {
        Some((&name[..split_at], &name[split_at..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn expand_ranges_and_singles() {
        let names = expand("n[0-3,8],login1").unwrap();
        assert_eq!(names, strings(&["n0", "n1", "n2", "n3", "n8", "login1"]));
    }

    #[test]
    fn expand_preserves_zero_padding() {
        let names = expand("gpu[01-03]").unwrap();
        assert_eq!(names, strings(&["gpu01", "gpu02", "gpu03"]));
    }

    #[test]
    fn compress_rebuilds_ranges() {
        let names = strings(&["n0", "n1", "n2", "n3", "n8", "login1"]);
        assert_eq!(compress(&names), "n[0-3,8],login1");
    }

    #[test]
    fn compress_keeps_width_groups_apart() {
        // n1 and n01 are different hosts; widths must not merge.
        let names = strings(&["n1", "n01", "n02"]);
        assert_eq!(compress(&names), "n1,n[01-02]");
    }

    #[test]
    fn round_trip() {
        let expr = "rack1-n[0-15],gpu[01-02],head";
        let names = expand(expr).unwrap();
        assert_eq!(compress(&names), expr);
    }

    #[test]
    fn malformed_expressions_rejected() {
        assert!(expand("n[0-").is_err());
        assert!(expand("n[[0-1]]").is_err());
        assert!(expand("n[3-1]").is_err());
        assert!(expand("").is_err());
    }
}
