use crate::error::ParseError;
use crate::filter::{Comparator, Condition, FilterNode, LogicalOp};

/// Parse a `filter_by` expression into a [`FilterNode`] tree.
///
/// Grammar, loosest binding first:
/// - `a || b` — alternation
/// - `a && b` — conjunction (binds tighter than `||`)
/// - `(expr)` — grouping
/// - `$coll(expr)` — filter through a referenced collection
/// - `field:value` — token match (strings) / equality (everything else)
/// - `field:=value`, `field:!=value` — exact / negated exact
/// - `field:=[a, b]` — membership
/// - `field:>n`, `:>=n`, `:<n`, `:<=n` — numeric comparisons
/// - `field:[10..100]` — inclusive range
/// - `field:(lat, lng, 5.1 km)` — geo radius (`km` or `mi`)
///
/// Values containing separators must be backtick-quoted.
pub fn parse_filter(input: &str) -> Result<FilterNode, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut parser = Parser { chars, pos: 0 };
    let node = parser.parse_or()?;
    parser.skip_ws();
    if !parser.eof() {
        return Err(ParseError(format!(
            "unexpected trailing input at offset {}",
            parser.pos
        )));
    }
    Ok(node)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> Result<(), ParseError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(ParseError(format!("expected '{expected}', found '{c}'"))),
            None => Err(ParseError(format!("expected '{expected}', found end"))),
        }
    }

    /// True when the next two characters are `op` (`&&` or `||`).
    fn at_connective(&self, op: char) -> bool {
        self.chars.get(self.pos) == Some(&op) && self.chars.get(self.pos + 1) == Some(&op)
    }

    // ── Expression levels ───────────────────────────────────────

    fn parse_or(&mut self) -> Result<FilterNode, ParseError> {
        let mut children = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            if self.at_connective('|') {
                self.pos += 2;
                children.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(flatten(LogicalOp::Or, children))
    }

    fn parse_and(&mut self) -> Result<FilterNode, ParseError> {
        let mut children = vec![self.parse_unit()?];
        loop {
            self.skip_ws();
            if self.at_connective('&') {
                self.pos += 2;
                children.push(self.parse_unit()?);
            } else {
                break;
            }
        }
        Ok(flatten(LogicalOp::And, children))
    }

    fn parse_unit(&mut self) -> Result<FilterNode, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.bump();
                let inner = self.parse_or()?;
                self.skip_ws();
                self.eat(')')?;
                Ok(inner)
            }
            Some('$') => self.parse_reference(),
            Some(_) => self.parse_condition(),
            None => Err(ParseError("empty filter expression".into())),
        }
    }

    fn parse_reference(&mut self) -> Result<FilterNode, ParseError> {
        self.eat('$')?;
        let collection = self.parse_ident()?;
        self.skip_ws();
        self.eat('(')?;
        let inner = self.parse_or()?;
        self.skip_ws();
        self.eat(')')?;
        Ok(FilterNode::Reference {
            collection,
            expr: Box::new(inner),
        })
    }

    // ── Conditions ──────────────────────────────────────────────

    fn parse_condition(&mut self) -> Result<FilterNode, ParseError> {
        let field = self.parse_ident()?;
        self.skip_ws();
        self.eat(':')?;
        self.skip_ws();

        let (comparator, values) = match self.peek() {
            Some('=') => {
                self.bump();
                self.skip_ws();
                if self.peek() == Some('[') {
                    (Comparator::Eq, self.parse_list()?)
                } else {
                    (Comparator::Eq, vec![self.parse_value()?])
                }
            }
            Some('!') => {
                self.bump();
                self.eat('=')?;
                self.skip_ws();
                if self.peek() == Some('[') {
                    (Comparator::Ne, self.parse_list()?)
                } else {
                    (Comparator::Ne, vec![self.parse_value()?])
                }
            }
            Some('>') => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    (Comparator::Gte, vec![self.parse_value()?])
                } else {
                    (Comparator::Gt, vec![self.parse_value()?])
                }
            }
            Some('<') => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    (Comparator::Lte, vec![self.parse_value()?])
                } else {
                    (Comparator::Lt, vec![self.parse_value()?])
                }
            }
            Some('[') => {
                let items = self.parse_list()?;
                if items.len() == 1 && items[0].contains("..") {
                    let (min, max) = split_range(&items[0])?;
                    (Comparator::Between, vec![min, max])
                } else {
                    (Comparator::Contains, items)
                }
            }
            Some('(') => {
                let (lat, lng, radius_meters) = self.parse_geo_radius()?;
                (
                    Comparator::GeoRadius {
                        lat,
                        lng,
                        radius_meters,
                    },
                    vec![],
                )
            }
            Some(_) => (Comparator::Contains, vec![self.parse_value()?]),
            None => return Err(ParseError(format!("missing value for field `{field}`"))),
        };

        if values.iter().any(|v| v.is_empty()) {
            return Err(ParseError(format!("empty value for field `{field}`")));
        }

        Ok(FilterNode::Condition(Condition {
            field,
            comparator,
            values,
        }))
    }

    fn parse_ident(&mut self) -> Result<String, ParseError> {
        self.skip_ws();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ParseError(format!(
                "expected field name at offset {}",
                start
            )));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// A bare or backtick-quoted value. Bare values end at a top-level
    /// `&&`, `||`, `)`, `]`, `,` or end of input.
    fn parse_value(&mut self) -> Result<String, ParseError> {
        self.skip_ws();
        if self.peek() == Some('`') {
            self.bump();
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == '`' {
                    let value: String = self.chars[start..self.pos].iter().collect();
                    self.bump();
                    return Ok(value);
                }
                self.pos += 1;
            }
            return Err(ParseError("unterminated backtick value".into()));
        }

        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ')' || c == ']' || c == ',' {
                break;
            }
            if (c == '&' || c == '|') && self.at_connective(c) {
                break;
            }
            self.pos += 1;
        }
        let value: String = self.chars[start..self.pos].iter().collect();
        Ok(value.trim().to_string())
    }

    fn parse_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.eat('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.bump();
                break;
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {
                    self.bump();
                    break;
                }
                other => {
                    return Err(ParseError(format!(
                        "expected ',' or ']' in list, found {other:?}"
                    )));
                }
            }
        }
        if items.is_empty() {
            return Err(ParseError("empty value list".into()));
        }
        Ok(items)
    }

    fn parse_geo_radius(&mut self) -> Result<(f64, f64, f64), ParseError> {
        self.eat('(')?;
        let lat = self.parse_value()?;
        self.eat(',')?;
        let lng = self.parse_value()?;
        self.eat(',')?;
        let radius = self.parse_value()?;
        self.skip_ws();
        self.eat(')')?;

        let lat: f64 = lat
            .parse()
            .map_err(|_| ParseError(format!("invalid latitude: {lat}")))?;
        let lng: f64 = lng
            .parse()
            .map_err(|_| ParseError(format!("invalid longitude: {lng}")))?;

        let radius = radius.trim();
        let (num, factor) = if let Some(km) = radius.strip_suffix("km") {
            (km.trim(), 1000.0)
        } else if let Some(mi) = radius.strip_suffix("mi") {
            (mi.trim(), 1609.34)
        } else {
            return Err(ParseError(format!(
                "geo radius must end in `km` or `mi`: {radius}"
            )));
        };
        let meters: f64 = num
            .parse::<f64>()
            .map(|r| r * factor)
            .map_err(|_| ParseError(format!("invalid geo radius: {radius}")))?;

        Ok((lat, lng, meters))
    }
}

fn flatten(logical: LogicalOp, mut children: Vec<FilterNode>) -> FilterNode {
    if children.len() == 1 {
        children.pop().expect("one child")
    } else {
        FilterNode::Group { logical, children }
    }
}

fn split_range(item: &str) -> Result<(String, String), ParseError> {
    let mut parts = item.splitn(2, "..");
    let min = parts.next().unwrap_or("").trim();
    let max = parts.next().unwrap_or("").trim();
    if min.is_empty() || max.is_empty() {
        return Err(ParseError(format!("malformed range: {item}")));
    }
    Ok((min.to_string(), max.to_string()))
}
