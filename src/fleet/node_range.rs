//! Node-range expansion
//!
//! Turns compact syntax such as `1,2,4-8` into a sorted, deduplicated list
//! of node numbers. "All nodes" is expressed by the *absence* of a
//! selection, never by an empty string: [`expand_node_range`] rejects
//! empty input and [`NodeSelection`] can only hold a non-empty set.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Widest range accepted in a single `a-b` token
pub const MAX_RANGE_SPAN: u32 = 65_536;

/// Errors produced while expanding a node range
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeRangeError {
    #[error("Empty node list; omit the selection to target all nodes")]
    EmptyInput,

    #[error("Empty token at position {0} in node list")]
    EmptyToken(usize),

    #[error("Invalid node number '{0}'")]
    NotANumber(String),

    #[error("Invalid range '{0}': start is greater than end")]
    InvertedRange(String),

    #[error("Invalid range '{0}': more than one '-'")]
    MultipleDashes(String),

    #[error("Range '{0}' spans more than {max} nodes", max = MAX_RANGE_SPAN)]
    RangeTooLarge(String),
}

fn parse_number(raw: &str) -> Result<u32, NodeRangeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NodeRangeError::NotANumber(raw.to_string()));
    }
    trimmed
        .parse::<u32>()
        .map_err(|_| NodeRangeError::NotANumber(raw.to_string()))
}

/// Expand `1,3,5-7` into `[1, 3, 5, 6, 7]`
///
/// Fails without returning a partial result on empty input, empty tokens,
/// non-numeric tokens, inverted ranges and tokens with more than one `-`.
pub fn expand_node_range(input: &str) -> Result<Vec<u32>, NodeRangeError> {
    if input.trim().is_empty() {
        return Err(NodeRangeError::EmptyInput);
    }

    let mut nodes = BTreeSet::new();
    for (position, token) in input.split(',').enumerate() {
        let token = token.trim();
        if token.is_empty() {
            return Err(NodeRangeError::EmptyToken(position));
        }

        let parts: Vec<&str> = token.split('-').collect();
        match parts.as_slice() {
            [single] => {
                nodes.insert(parse_number(single)?);
            }
            [start, end] => {
                let start = parse_number(start)
                    .map_err(|_| NodeRangeError::NotANumber(token.to_string()))?;
                let end =
                    parse_number(end).map_err(|_| NodeRangeError::NotANumber(token.to_string()))?;
                if start > end {
                    return Err(NodeRangeError::InvertedRange(token.to_string()));
                }
                if end - start >= MAX_RANGE_SPAN {
                    return Err(NodeRangeError::RangeTooLarge(token.to_string()));
                }
                nodes.extend(start..=end);
            }
            _ => return Err(NodeRangeError::MultipleDashes(token.to_string())),
        }
    }

    Ok(nodes.into_iter().collect())
}

/// A non-empty, sorted, deduplicated set of node numbers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeSelection(Vec<u32>);

impl NodeSelection {
    /// Parse a user-supplied node list; `None` means every node
    pub fn parse_optional(input: Option<&str>) -> Result<Option<Self>, NodeRangeError> {
        input.map(str::parse).transpose()
    }

    /// Build a selection from explicit numbers
    pub fn from_numbers(numbers: impl IntoIterator<Item = u32>) -> Result<Self, NodeRangeError> {
        let set: BTreeSet<u32> = numbers.into_iter().collect();
        if set.is_empty() {
            return Err(NodeRangeError::EmptyInput);
        }
        Ok(Self(set.into_iter().collect()))
    }

    pub fn numbers(&self) -> &[u32] {
        &self.0
    }

    pub fn contains(&self, node_no: u32) -> bool {
        self.0.binary_search(&node_no).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with collections
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for NodeSelection {
    type Err = NodeRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        expand_node_range(s).map(NodeSelection)
    }
}

impl fmt::Display for NodeSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        f.write_str(&joined.join(","))
    }
}
