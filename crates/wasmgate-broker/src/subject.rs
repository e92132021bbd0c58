/// Subject filter matching: `*` matches exactly one token, a trailing `>`
/// matches one or more remaining tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::subject_matches;

    #[test]
    fn literal_and_single_wildcard() {
        assert!(subject_matches("t.abc.exec.f1", "t.abc.exec.f1"));
        assert!(subject_matches("t.abc.exec.*", "t.abc.exec.f1"));
        assert!(!subject_matches("t.abc.exec.*", "t.abc.exec.f1.extra"));
        assert!(!subject_matches("t.abc.exec.*", "t.abc.exec"));
        assert!(!subject_matches("t.abc.exec.*", "t.xyz.exec.f1"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("t.abc.>", "t.abc.exec.f1"));
        assert!(subject_matches("t.abc.>", "t.abc.exec.f1.extra"));
        assert!(!subject_matches("t.abc.>", "t.abc"));
    }

    #[test]
    fn empty_patterns_do_not_match_everything() {
        assert!(!subject_matches("", "t.abc"));
        assert!(!subject_matches("t.abc", ""));
    }
}
