//! Job feature expressions
//!
//! A feature expression is a flat left-to-right list of `(name, count, op)`
//! terms. `[a|b]` brackets a mutually-exclusive group: each member is an
//! alternative, and evaluation reports which alternatives satisfied the
//! whole expression as bits of a 32-bit map. `name*count` asks for that
//! many nodes carrying the feature; counted terms always evaluate as
//! satisfied here because the selector accumulates them separately.
//!
//! Brackets do not nest, `&` may not appear inside a group, and a count
//! may not be combined with `|`.

use crate::constants::MAX_FEATURES;
use crate::error::{ControllerError, ControllerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Operator connecting a term to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureOp {
    And,
    Or,
    /// Mutually-exclusive alternative inside a bracket group.
    Xor,
    End,
}

/// One term of the expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTerm {
    pub name: String,
    /// Nodes requested with this feature; 0 when unconstrained.
    pub count: u32,
    pub op: FeatureOp,
}

/// Parsed feature expression.
///
/// A bracket group is stored flat: every member but the last carries
/// [`FeatureOp::Xor`]; the last member carries the operator that follows
/// the closing bracket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureList {
    terms: Vec<FeatureTerm>,
}

impl FeatureList {
    /// Parse an expression like `gpu*2&fast` or `[fsA|fsB]&big`.
    ///
    /// Bracket-structure violations (nesting, a second group) keep the
    /// historical non-specific node-config error code; other malformed
    /// input fails with a structural error.
    pub fn parse(expr: &str) -> ControllerResult<FeatureList> {
        let mut terms: Vec<FeatureTerm> = Vec::new();
        let mut name = String::new();
        let mut count = 0u32;
        let mut in_bracket = false;
        let mut seen_bracket = false;
        let mut have_count = false;
        let mut have_or = false;

        let structural = |msg: &str| ControllerError::InvalidFeatureExpression(msg.to_string());

        let mut chars = expr.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '[' => {
                    if seen_bracket || !name.is_empty() {
                        // Nested or repeated groups keep the historical code.
                        return Err(ControllerError::RequestedNodeConfigUnavailable);
                    }
                    in_bracket = true;
                    seen_bracket = true;
                }
                ']' => {
                    if !in_bracket || name.is_empty() {
                        return Err(ControllerError::RequestedNodeConfigUnavailable);
                    }
                    in_bracket = false;
                    // The closing term's operator comes from what follows.
                }
                '*' => {
                    if name.is_empty() {
                        return Err(structural("count without feature name"));
                    }
                    let mut digits = String::new();
                    while let Some(d) = chars.peek() {
                        if d.is_ascii_digit() {
                            digits.push(*d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    count = digits
                        .parse()
                        .map_err(|_| structural("count is not a number"))?;
                    if count == 0 {
                        return Err(structural("count must be positive"));
                    }
                    have_count = true;
                }
                '&' => {
                    if in_bracket {
                        return Err(structural("'&' not allowed inside a bracket group"));
                    }
                    if name.is_empty() {
                        return Err(structural("'&' without feature name"));
                    }
                    terms.push(FeatureTerm {
                        name: std::mem::take(&mut name),
                        count: std::mem::take(&mut count),
                        op: FeatureOp::And,
                    });
                }
                '|' => {
                    if name.is_empty() {
                        return Err(structural("'|' without feature name"));
                    }
                    have_or = true;
                    terms.push(FeatureTerm {
                        name: std::mem::take(&mut name),
                        count: std::mem::take(&mut count),
                        op: if in_bracket {
                            FeatureOp::Xor
                        } else {
                            FeatureOp::Or
                        },
                    });
                }
                c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                    name.push(c);
                }
                c => {
                    return Err(structural(&format!("unexpected character '{c}'")));
                }
            }
        }

        if in_bracket {
            return Err(ControllerError::RequestedNodeConfigUnavailable);
        }
        if name.is_empty() {
            if terms.is_empty() {
                return Err(structural("empty expression"));
            }
            return Err(structural("trailing operator"));
        }
        terms.push(FeatureTerm {
            name,
            count,
            op: FeatureOp::End,
        });

        if have_count && have_or {
            return Err(structural("count may not be combined with '|'"));
        }

        Ok(FeatureList { terms })
    }

    pub fn terms(&self) -> &[FeatureTerm] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Terms carrying a `*count` request, in expression order.
    pub fn count_requests(&self) -> Vec<(&str, u32)> {
        self.terms
            .iter()
            .filter(|t| t.count > 0)
            .map(|t| (t.name.as_str(), t.count))
            .collect()
    }

    /// Number of mutually-exclusive alternatives (0 when no group).
    pub fn alternative_count(&self) -> usize {
        let mut n = 0;
        let mut last_was_xor = false;
        for term in &self.terms {
            if term.op == FeatureOp::Xor || last_was_xor {
                n += 1;
            }
            last_was_xor = term.op == FeatureOp::Xor;
        }
        n
    }

    /// Evaluate against a node's feature set.
    ///
    /// Returns a bitmap naming the satisfied alternatives: bit 0 set when a
    /// group-free expression holds, per-alternative bits when a group is
    /// present, and 0 when the expression does not hold at all. Counted
    /// terms evaluate as satisfied; their accumulation happens in the
    /// selector.
    pub fn matching_alternatives(&self, available: &[String]) -> u32 {
        if self.terms.is_empty() {
            return 1;
        }
        let has = |name: &str| available.iter().any(|f| f == name);

        let mut result = true;
        let mut save_result = true;
        let mut save_op = FeatureOp::And;
        let mut last_op = FeatureOp::And;
        let mut position = 0usize;
        let mut bits: u32 = 0;

        for term in &self.terms {
            let found = term.count > 0 || has(&term.name);

            if last_op == FeatureOp::Xor || term.op == FeatureOp::Xor {
                if position == 0 {
                    save_op = last_op;
                    save_result = result;
                    result = found;
                } else {
                    result = result || found;
                }
                if found {
                    if position < MAX_FEATURES {
                        bits |= 1 << position;
                    } else {
                        error!("feature alternative overflow at {}", term.name);
                    }
                }
                position += 1;
                if term.op != FeatureOp::Xor {
                    if save_op == FeatureOp::Or {
                        result = result || save_result;
                    } else {
                        result = result && save_result;
                    }
                }
            } else if last_op == FeatureOp::Or {
                result = result || found;
            } else {
                result = result && found;
            }
            last_op = term.op;
        }

        if !result {
            0
        } else if bits == 0 {
            1
        } else {
            bits
        }
    }
}

impl fmt::Display for FeatureList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut last_op = FeatureOp::End;
        for term in &self.terms {
            let opens_group = term.op == FeatureOp::Xor && last_op != FeatureOp::Xor;
            let closes_group = last_op == FeatureOp::Xor && term.op != FeatureOp::Xor;
            if opens_group {
                write!(f, "[")?;
            }
            write!(f, "{}", term.name)?;
            if term.count > 0 {
                write!(f, "*{}", term.count)?;
            }
            if closes_group {
                write!(f, "]")?;
            }
            match term.op {
                FeatureOp::And => write!(f, "&")?,
                FeatureOp::Or | FeatureOp::Xor => write!(f, "|")?,
                FeatureOp::End => {}
            }
            last_op = term.op;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feats(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_conjunction_with_counts() {
        let list = FeatureList::parse("gpu*1&fast*1").unwrap();
        assert_eq!(list.terms().len(), 2);
        assert_eq!(list.count_requests(), vec![("gpu", 1), ("fast", 1)]);
        assert_eq!(list.alternative_count(), 0);
    }

    #[test]
    fn parse_bracket_group() {
        let list = FeatureList::parse("[fsA|fsB]&big").unwrap();
        let ops: Vec<FeatureOp> = list.terms().iter().map(|t| t.op).collect();
        assert_eq!(ops, vec![FeatureOp::Xor, FeatureOp::And, FeatureOp::End]);
        assert_eq!(list.alternative_count(), 2);
    }

    #[test]
    fn display_round_trips() {
        for expr in [
            "gpu",
            "gpu*2",
            "gpu&fast",
            "a|b",
            "[fsA|fsB]&big",
            "big&[fsA|fsB]",
            "a&b&c",
            "gpu*1&fast*1",
        ] {
            let parsed = FeatureList::parse(expr).unwrap();
            assert_eq!(parsed.to_string(), expr, "display of {expr}");
            assert_eq!(FeatureList::parse(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn nested_brackets_keep_historical_code() {
        assert!(matches!(
            FeatureList::parse("[[a|b]]"),
            Err(ControllerError::RequestedNodeConfigUnavailable)
        ));
        assert!(matches!(
            FeatureList::parse("[a|b]&[c|d]"),
            Err(ControllerError::RequestedNodeConfigUnavailable)
        ));
        assert!(matches!(
            FeatureList::parse("[a|b"),
            Err(ControllerError::RequestedNodeConfigUnavailable)
        ));
    }

    #[test]
    fn count_with_or_rejected() {
        assert!(matches!(
            FeatureList::parse("a*2|b"),
            Err(ControllerError::InvalidFeatureExpression(_))
        ));
        assert!(matches!(
            FeatureList::parse("a*0"),
            Err(ControllerError::InvalidFeatureExpression(_))
        ));
        assert!(matches!(
            FeatureList::parse("&a"),
            Err(ControllerError::InvalidFeatureExpression(_))
        ));
    }

    #[test]
    fn eval_simple_conjunction() {
        let list = FeatureList::parse("gpu&fast").unwrap();
        assert_eq!(list.matching_alternatives(&feats(&["gpu", "fast"])), 1);
        assert_eq!(list.matching_alternatives(&feats(&["gpu"])), 0);
    }

    #[test]
    fn eval_reports_satisfied_alternatives() {
        let list = FeatureList::parse("[fsA|fsB]&big").unwrap();
        assert_eq!(list.matching_alternatives(&feats(&["fsA", "big"])), 0b01);
        assert_eq!(list.matching_alternatives(&feats(&["fsB", "big"])), 0b10);
        assert_eq!(
            list.matching_alternatives(&feats(&["fsA", "fsB", "big"])),
            0b11
        );
        // Alternative present but the conjunct missing: no match at all.
        assert_eq!(list.matching_alternatives(&feats(&["fsA"])), 0);
    }

    #[test]
    fn counted_terms_always_evaluate_found() {
        let list = FeatureList::parse("gpu*1&fast*1").unwrap();
        // Accumulation happens elsewhere; evaluation must not filter.
        assert_eq!(list.matching_alternatives(&feats(&[])), 1);
    }

    #[test]
    fn empty_expression_matches_everything() {
        let list = FeatureList::default();
        assert_eq!(list.matching_alternatives(&feats(&[])), 1);
    }
}
