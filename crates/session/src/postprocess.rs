//! Text clean-up applied to finished generations.

/// Appended when the engine stopped at the context window.
pub const TRUNCATION_NOTICE: &str = " [output truncated due to context length limit...]";

const TERMINALS: [char; 6] = ['。', '！', '？', '.', '?', '!'];

/// Sentences shorter than this (in chars) are ignored by repeat detection.
const MIN_SENTENCE_CHARS: usize = 5;

/// Split after every terminal punctuation mark, keeping the mark with its
/// sentence. Pieces are trimmed; empty pieces are dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if TERMINALS.contains(&c) {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    sentences.push(&text[start..]);
    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// True when the last sentence of `text` repeats an earlier one, a sign the
/// model is looping.
pub fn detect_repeat_tail(text: &str) -> bool {
    let sentences: Vec<_> = split_sentences(text)
        .into_iter()
        .filter(|s| s.chars().count() >= MIN_SENTENCE_CHARS)
        .collect();
    match sentences.split_last() {
        Some((last, prior)) => prior.contains(last),
        None => false,
    }
}

/// Drop the trailing run of sentences that already appeared earlier, and a
/// cut-off fragment following such a run. Sentences are rejoined without
/// separators.
pub fn dedupe_repeated_tail(text: &str) -> String {
    let sentences = split_sentences(text);
    let repeats = |i: usize| sentences[..i].contains(&sentences[i]);

    let mut end = sentences.len();
    if end >= 2 && !ends_with_terminal(sentences[end - 1]) && repeats(end - 2) {
        end -= 1;
    }
    while end > 0 && repeats(end - 1) {
        end -= 1;
    }
    sentences[..end].concat()
}

fn ends_with_terminal(sentence: &str) -> bool {
    sentence.chars().last().is_some_and(|c| TERMINALS.contains(&c))
}
