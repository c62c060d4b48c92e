use regex::Regex;
use std::sync::OnceLock;

const ESC: char = '\u{1b}';

fn escape_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // CSI: ESC [ params letter. OSC: ESC ] ... BEL.
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-9;?]*[A-Za-z]|\][^\x07]*\x07)").expect("escape pattern is valid")
    })
}

/// Removes CSI and OSC escape sequences from a decoded line.
///
/// Any ESC left over after the pass (an incomplete sequence, or one that only
/// became adjacent once its neighbour was removed) is dropped as well, so the
/// result never contains control introducers and a second pass is a no-op.
pub fn strip_ansi(input: &str) -> String {
    if !input.contains(ESC) {
        return input.to_string();
    }
    let stripped = escape_pattern().replace_all(input, "");
    stripped.chars().filter(|ch| *ch != ESC).collect()
}
