//! Spintax expansion - `{Hi|Hello} {there|friend}` to one concrete variant.
//!
//! Groups are flat: `{` opens, the next `}` closes, and a group may not
//! contain another `{`. Anything that does not form a complete group (an
//! unterminated `{`, a stray `}`) is left in the output verbatim.

use std::sync::OnceLock;

use rand::prelude::*;
use regex::{Captures, Regex};

fn group_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("spintax pattern is valid"))
}

/// Expand every spintax group using the thread-local RNG.
pub fn expand(template: &str) -> String {
    expand_with(template, &mut thread_rng())
}

/// Expand every spintax group, drawing choices from `rng`.
///
/// Each group picks one of its `|`-separated options uniformly and
/// independently of the other groups. A group without `|` is replaced by its
/// only option.
pub fn expand_with<R: Rng + ?Sized>(template: &str, rng: &mut R) -> String {
    group_pattern()
        .replace_all(template, |caps: &Captures| {
            let options: Vec<&str> = caps[1].split('|').collect();
            // split always yields at least one item
            options.choose(&mut *rng).copied().unwrap_or_default().to_string()
        })
        .into_owned()
}
