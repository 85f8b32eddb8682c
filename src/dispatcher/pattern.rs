//! Keyword/wildcard/alternation matching for speech triggers (spec §4.1/§9).
//!
//! Pattern syntax: `|` separates alternatives (OR), `*` inside an
//! alternative is a wildcard matching any run of characters. Matching is
//! case-insensitive and, absent any `*`, substring-based (`"pump"` matches
//! "please pump it").

/// True if any configured keyword pattern matches `content`. An empty
/// pattern list always matches (spec §4.1: "no keywords are configured").
pub fn matches_any(patterns: &[String], content: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let content_lower = content.to_lowercase();
    patterns
        .iter()
        .any(|p| matches_one(p, &content_lower))
}

fn matches_one(pattern: &str, content_lower: &str) -> bool {
    pattern
        .split('|')
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .any(|alt| alt_matches(alt, content_lower))
}

fn alt_matches(alt: &str, content_lower: &str) -> bool {
    let alt_lower = alt.to_lowercase();
    if alt_lower.contains('*') {
        wildcard_matches(&alt_lower, content_lower)
    } else {
        content_lower.contains(&alt_lower)
    }
}

fn wildcard_matches(pattern: &str, content: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (idx, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        if idx == 0 && !pattern.starts_with('*') {
            if !content[pos..].starts_with(seg) {
                return false;
            }
            pos += seg.len();
        } else {
            match content[pos..].find(seg) {
                Some(found) => pos += found + seg.len(),
                None => return false,
            }
        }
    }
    if !pattern.ends_with('*') {
        if let Some(last) = segments.last() {
            if !last.is_empty() && !content.ends_with(last) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patterns_always_match() {
        assert!(matches_any(&[], "anything"));
    }

    #[test]
    fn plain_substring_is_case_insensitive() {
        let patterns = vec!["pump".to_string()];
        assert!(matches_any(&patterns, "please Pump it"));
        assert!(!matches_any(&patterns, "nothing here"));
    }

    #[test]
    fn alternation_matches_any_branch() {
        let patterns = vec!["pump|vibe".to_string()];
        assert!(matches_any(&patterns, "turn on the vibe"));
        assert!(matches_any(&patterns, "pump it"));
        assert!(!matches_any(&patterns, "turn it off"));
    }

    #[test]
    fn wildcard_matches_prefix_and_suffix() {
        let patterns = vec!["*pump*".to_string()];
        assert!(matches_any(&patterns, "please pump it now"));
        assert!(matches_any(&patterns, "pump"));
        assert!(!matches_any(&patterns, "nothing"));
    }

    #[test]
    fn wildcard_anchored_prefix() {
        let patterns = vec!["start*".to_string()];
        assert!(matches_any(&patterns, "start the engine"));
        assert!(!matches_any(&patterns, "please start"));
    }
}
