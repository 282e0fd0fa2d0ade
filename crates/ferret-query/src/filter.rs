use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

/// Comparison applied by a single filter condition. Values stay raw strings
/// here; the evaluator types them against the collection schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparator {
    /// `:=` — exact value match (or membership when multiple values).
    Eq,
    /// `:` — token match for strings, equality for everything else.
    Contains,
    /// `:!=` — negated exact match.
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// `:[min..max]` — inclusive numeric range.
    Between,
    /// `:(lat, lng, radius)` — geopoint radius in meters.
    GeoRadius {
        lat: f64,
        lng: f64,
        radius_meters: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    /// One entry for scalar comparisons, several for `[a, b, c]` lists,
    /// exactly two for `Between`.
    pub values: Vec<String>,
}

/// Filter expression tree built by [`parse_filter`](crate::parse_filter).
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Condition(Condition),
    Group {
        logical: LogicalOp,
        children: Vec<FilterNode>,
    },
    /// `$collection(expr)` — filter through a referenced collection.
    Reference {
        collection: String,
        expr: Box<FilterNode>,
    },
}

impl FilterNode {
    /// Every field name mentioned anywhere in the tree (references excluded).
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterNode::Condition(c) => out.push(&c.field),
            FilterNode::Group { children, .. } => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            FilterNode::Reference { .. } => {}
        }
    }
}
