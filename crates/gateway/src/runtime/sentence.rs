//! Sentence-boundary detection for TTS flush points.
//!
//! A `.`, `?`, or `!` ends a sentence when it is followed by whitespace
//! and the next visible character is not a digit, and the word before a
//! period is not a known abbreviation. Flushing complete sentences as
//! they stream keeps time-to-first-audio low.

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "inc", "ltd", "dept", "approx",
    "no",
];

pub struct SentenceSplitter {
    buf: String,
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Append a token chunk; returns any sentences completed by it.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buf.push_str(token);
        let mut sentences = Vec::new();
        while let Some(split_at) = find_boundary(&self.buf) {
            let rest = self.buf.split_off(split_at);
            let sentence = std::mem::replace(&mut self.buf, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
        }
        sentences
    }

    /// Flush whatever remains at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buf);
        let tail = tail.trim();
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_owned())
        }
    }
}

/// Byte index just past the first confirmed sentence boundary, if any.
fn find_boundary(buf: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = buf.char_indices().collect();
    for (i, &(idx, ch)) in chars.iter().enumerate() {
        if !matches!(ch, '.' | '?' | '!') {
            continue;
        }
        // Need at least one following char to judge the boundary.
        let Some(&(_, next)) = chars.get(i + 1) else {
            return None;
        };
        if !next.is_whitespace() {
            // "3.5", "e.g.", quoted punctuation: not a flush point.
            continue;
        }
        // The character after the whitespace must not be a digit (list
        // numbering like "1. " is handled upstream by the model).
        if let Some(&(_, after)) = chars.get(i + 2) {
            if after.is_ascii_digit() {
                continue;
            }
        }
        if ch == '.' && is_abbreviation(&buf[..idx]) {
            continue;
        }
        return Some(chars.get(i + 1).map(|&(j, _)| j).unwrap_or(buf.len()));
    }
    None
}

fn is_abbreviation(prefix: &str) -> bool {
    let word: String = prefix
        .chars()
        .rev()
        .take_while(|c| c.is_alphanumeric())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if word.is_empty() {
        return false;
    }
    // Single letters read as initials ("J. Smith").
    if word.len() == 1 && word.chars().all(|c| c.is_alphabetic()) {
        return true;
    }
    ABBREVIATIONS.contains(&word.to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(chunks: &[&str]) -> (Vec<String>, Option<String>) {
        let mut splitter = SentenceSplitter::new();
        let mut sentences = Vec::new();
        for chunk in chunks {
            sentences.extend(splitter.push(chunk));
        }
        (sentences, splitter.flush())
    }

    #[test]
    fn splits_on_terminal_punctuation() {
        let (sentences, tail) =
            split_all(&["Straus is in review. ", "The team updated it last week."]);
        assert_eq!(sentences, vec!["Straus is in review."]);
        assert_eq!(tail.as_deref(), Some("The team updated it last week."));
    }

    #[test]
    fn boundary_can_arrive_across_chunks() {
        let (sentences, _) = split_all(&["How can I", " help?", " I'm listening."]);
        assert_eq!(sentences, vec!["How can I help?"]);
    }

    #[test]
    fn decimal_numbers_do_not_split() {
        let (sentences, tail) = split_all(&["The budget is 3.5 million dollars. Sound good?"]);
        assert_eq!(sentences, vec!["The budget is 3.5 million dollars."]);
        assert_eq!(tail.as_deref(), Some("Sound good?"));
    }

    #[test]
    fn abbreviations_do_not_split() {
        let (sentences, tail) = split_all(&["Dr. Reyes approved it. Anything else?"]);
        assert_eq!(sentences, vec!["Dr. Reyes approved it."]);
        assert_eq!(tail.as_deref(), Some("Anything else?"));
    }

    #[test]
    fn initials_do_not_split() {
        let (sentences, _) = split_all(&["I spoke with J. Smith yesterday. He agreed."]);
        assert_eq!(sentences, vec!["I spoke with J. Smith yesterday."]);
    }

    #[test]
    fn digit_after_boundary_defers_split() {
        let (sentences, tail) = split_all(&["Here are the steps. 1 is easy"]);
        assert!(sentences.is_empty());
        assert_eq!(tail.as_deref(), Some("Here are the steps. 1 is easy"));
    }

    #[test]
    fn flush_returns_unterminated_tail_once() {
        let mut splitter = SentenceSplitter::new();
        splitter.push("thanks for calling");
        assert_eq!(splitter.flush().as_deref(), Some("thanks for calling"));
        assert!(splitter.flush().is_none());
    }
}
