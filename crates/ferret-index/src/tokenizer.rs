/// A normalised token with its position and byte span in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Lowercased text with dropped punctuation.
    pub text: String,
    /// 0-based token position.
    pub position: u16,
    /// Byte span of the raw token in the input, for highlighting.
    pub byte_start: usize,
    pub byte_end: usize,
}

/// Splits text into indexable tokens.
///
/// Alphanumeric runs form tokens. Characters listed in `symbols_to_index`
/// are kept inside tokens; characters in `separators` split tokens (on top
/// of whitespace); any other punctuation is dropped without splitting, so
/// `it's` indexes as `its`.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    symbols_to_index: Vec<char>,
    separators: Vec<char>,
}

impl Tokenizer {
    pub fn new(symbols_to_index: &[char], separators: &[char]) -> Self {
        Self {
            symbols_to_index: symbols_to_index.to_vec(),
            separators: separators.to_vec(),
        }
    }

    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut start = 0usize;
        let mut last_end = 0usize;

        for (i, ch) in text.char_indices() {
            let end = i + ch.len_utf8();
            if ch.is_alphanumeric() || self.symbols_to_index.contains(&ch) {
                if current.is_empty() {
                    start = i;
                }
                for lower in ch.to_lowercase() {
                    current.push(lower);
                }
                last_end = end;
            } else if ch.is_whitespace() || self.separators.contains(&ch) {
                flush(&mut tokens, &mut current, start, last_end);
            }
            // Other punctuation is dropped silently.
        }
        flush(&mut tokens, &mut current, start, last_end);
        tokens
    }

    /// Token texts only; offsets discarded.
    pub fn terms(&self, text: &str) -> Vec<String> {
        self.tokenize(text).into_iter().map(|t| t.text).collect()
    }
}

fn flush(tokens: &mut Vec<Token>, current: &mut String, start: usize, end: usize) {
    if current.is_empty() {
        return;
    }
    let position = tokens.len() as u16;
    tokens.push(Token {
        text: std::mem::take(current),
        position,
        byte_start: start,
        byte_end: end,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace_and_lowercases() {
        let t = Tokenizer::default();
        let terms = t.terms("Denim JEANS");
        assert_eq!(terms, vec!["denim", "jeans"]);
    }

    #[test]
    fn drops_inner_punctuation() {
        let t = Tokenizer::default();
        assert_eq!(t.terms("it's"), vec!["its"]);
    }

    #[test]
    fn separators_split() {
        let t = Tokenizer::new(&[], &['-']);
        assert_eq!(t.terms("t-shirt"), vec!["t", "shirt"]);
    }

    #[test]
    fn symbols_are_kept() {
        let t = Tokenizer::new(&['+'], &[]);
        assert_eq!(t.terms("c++ rocks"), vec!["c++", "rocks"]);
    }

    #[test]
    fn byte_spans_cover_raw_tokens() {
        let t = Tokenizer::default();
        let tokens = t.tokenize("red jacket");
        assert_eq!(tokens[0].byte_start, 0);
        assert_eq!(tokens[0].byte_end, 3);
        assert_eq!(tokens[1].byte_start, 4);
        assert_eq!(tokens[1].byte_end, 10);
        assert_eq!(tokens[1].position, 1);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let t = Tokenizer::default();
        assert!(t.tokenize("  ,, ").is_empty());
    }
}
