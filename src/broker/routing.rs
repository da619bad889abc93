//! AMQP topic-pattern matching.
//!
//! Routing keys and binding patterns are `.`-separated words; in a pattern `*` matches
//! exactly one word and `#` matches zero or more words.

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // matched[j]: the pattern words seen so far match key[..j]
    let mut matched = vec![false; key.len() + 1];
    matched[0] = true;

    for word in pattern {
        let mut next = vec![false; key.len() + 1];
        match *word {
            "#" => {
                let mut reachable = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    reachable |= matched[j];
                    *slot = reachable;
                }
            }
            "*" => next[1..].copy_from_slice(&matched[..key.len()]),
            literal => {
                for (j, key_word) in key.iter().enumerate() {
                    next[j + 1] = matched[j] && *key_word == literal;
                }
            }
        }
        matched = next;
    }

    matched[key.len()]
}
