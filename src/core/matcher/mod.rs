pub mod policy;
pub mod score;

pub use policy::{MatchVerdict, Matcher, REASON_MATCH};
pub use score::ratio_test_score;
