mod error;
mod filter;
mod params;
mod parse_filter;
mod sort;
mod vector;

pub use error::ParseError;
pub use filter::{Comparator, Condition, FilterNode, LogicalOp};
pub use params::{DirtyValues, DropTokensMode, IndexOp, InfixMode, SearchParams, TextMatchType};
pub use parse_filter::parse_filter;
pub use sort::{SortClause, SortOrder, SortTarget, parse_sort};
pub use vector::{VectorQuery, parse_vector_query};

/// Split on `sep` at depth zero — commas inside `(...)`, `[...]` or
/// backticks do not split. Used for `sort_by` and `facet_by` lists.
pub fn split_outside_parens(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_backtick = false;
    let mut current = String::new();

    for ch in input.chars() {
        match ch {
            '`' => {
                in_backtick = !in_backtick;
                current.push(ch);
            }
            '(' | '[' if !in_backtick => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' if !in_backtick => {
                depth -= 1;
                current.push(ch);
            }
            c if c == sep && depth == 0 && !in_backtick => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}
