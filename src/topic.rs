//! AMQP topic pattern matching.
//!
//! Routing keys and patterns are `.`-separated words. In a pattern `*`
//! matches exactly one word and `#` matches zero or more words. Every other
//! word must match literally.

/// Check whether `routing_key` matches the topic `pattern`.
///
/// ```
/// use routed_rust::topic::matches;
///
/// assert!(matches("a.*", "a.1"));
/// assert!(!matches("a.*", "a.1.2"));
/// assert!(matches("a.#", "a"));
/// assert!(matches("#", "anything.at.all"));
/// ```
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

/// Walks the pattern once, tracking which key prefixes it can have matched.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // `reachable[k]`: the pattern words seen so far match `key[..k]`.
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;

    for &word in pattern {
        let mut next = vec![false; key.len() + 1];
        if word == "#" {
            let mut seen = false;
            for (k, slot) in next.iter_mut().enumerate() {
                seen |= reachable[k];
                *slot = seen;
            }
        } else {
            for (k, &head) in key.iter().enumerate() {
                if reachable[k] && (word == "*" || word == head) {
                    next[k + 1] = true;
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }
    reachable[key.len()]
}

/// Whether `pattern` contains any wildcard word.
pub fn is_pattern(pattern: &str) -> bool {
    pattern.split('.').any(|w| w == "*" || w == "#")
}
