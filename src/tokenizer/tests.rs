use super::*;
use std::io::Write;
use tempfile::TempDir;

fn counter_with_vocab(entries: &[&str]) -> TokenCounter {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokenizer.json");
    let vocab: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
        .collect();
    let file_json = serde_json::json!({ "model": { "vocab": vocab } });
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(file_json.to_string().as_bytes()).unwrap();
    TokenCounter::new(&path)
}

#[test]
fn empty_text_counts_zero() {
    let counter = TokenCounter::without_vocab();
    assert_eq!(counter.count("", false), 0);
}

#[test]
fn special_tokens_add_two() {
    let counter = TokenCounter::without_vocab();
    assert_eq!(counter.count("", true), 2);
    assert_eq!(counter.count("hi", true), counter.count("hi", false) + 2);
}

#[test]
fn heuristic_tiers() {
    let counter = TokenCounter::without_vocab();
    // <= 4 chars: one token
    assert_eq!(counter.count("hill", false), 1);
    // 5..=8 chars: two tokens
    assert_eq!(counter.count("hillside", false), 2);
    // longer: ceil(len / 4)
    assert_eq!(counter.count("abcdefghijkl", false), 3);
}

#[test]
fn punctuation_splits_words() {
    let counter = TokenCounter::without_vocab();
    // "foo" + "." + "bar" -> three sub-tokens
    assert_eq!(counter.count("foo.bar", false), 3);
}

#[test]
fn whitespace_separates_words() {
    let counter = TokenCounter::without_vocab();
    assert_eq!(counter.count("one two", false), 2);
    assert_eq!(counter.count("one\n\ttwo", false), 2);
}

#[test]
fn cjk_chars_count_individually() {
    let counter = TokenCounter::without_vocab();
    // Each CJK codepoint is padded into its own word.
    assert_eq!(counter.count("你好", false), 2);
}

#[test]
fn non_ascii_non_cjk_dropped() {
    let counter = TokenCounter::without_vocab();
    assert_eq!(counter.count("café", false), counter.count("caf", false));
}

#[test]
fn vocab_longest_match() {
    let counter = counter_with_vocab(&["embed", "##ding", "##s"]);
    // "embeddings" -> embed + ##ding + ##s
    assert_eq!(counter.count("embeddings", false), 3);
}

#[test]
fn vocab_single_word_match() {
    let counter = counter_with_vocab(&["hello"]);
    assert_eq!(counter.count("hello", false), 1);
}

#[test]
fn vocab_miss_falls_back_to_chars() {
    // No prefix of "zz" is in the vocabulary, so each char becomes a
    // single-step piece.
    let counter = counter_with_vocab(&["hello"]);
    assert_eq!(counter.count("zz", false), 2);
}

#[test]
fn oversized_sub_token_counts_one() {
    let counter = counter_with_vocab(&["a"]);
    let long_word = "a".repeat(150);
    assert_eq!(counter.count(&long_word, false), 1);
}

#[test]
fn cache_is_consistent_across_calls() {
    let counter = counter_with_vocab(&["embed", "##ding"]);
    let first = counter.count("embedding", false);
    let second = counter.count("embedding", false);
    assert_eq!(first, second);
}

#[test]
fn missing_vocab_file_falls_back() {
    let counter = TokenCounter::new("/no/such/tokenizer.json");
    assert!(!counter.has_vocab());
    assert_eq!(counter.count("hill", false), 1);
}

#[test]
fn counter_is_shareable_across_threads() {
    use std::sync::Arc;

    let counter = Arc::new(counter_with_vocab(&["embed", "##ding", "##s"]));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || counter.count("embeddings", false))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 3);
    }
}
