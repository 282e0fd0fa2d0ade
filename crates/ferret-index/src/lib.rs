mod columns;
mod error;
mod geo;
mod levenshtein;
mod match_window;
mod postings;
mod tokenizer;

pub use columns::{GeoColumn, NumColumn, StrColumn, VectorColumn, ordered_f64};
pub use error::EvalError;
pub use geo::haversine_meters;
pub use levenshtein::bounded_levenshtein;
pub use match_window::{MATCH_WINDOW_SIZE, MAX_TOKENS_DISTANCE, Match};
pub use postings::{PostingList, TermHit, TermIndex};
pub use tokenizer::{Token, Tokenizer};
