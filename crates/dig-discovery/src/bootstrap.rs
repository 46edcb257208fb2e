//! Bootstrap rendezvous handling (§4.4 layer a).

/// Parse a list of configured bootstrap peer address strings, discarding
/// any that are empty after trimming.
#[must_use]
pub fn parse_bootstrap_peers(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_entries_are_dropped() {
        let parsed = parse_bootstrap_peers(&[
            "bootstrap1.example.com:4001".to_string(),
            "  ".to_string(),
            "bootstrap2.example.com:4001".to_string(),
        ]);
        assert_eq!(parsed.len(), 2);
    }
}
