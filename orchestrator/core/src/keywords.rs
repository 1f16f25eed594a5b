//! Whole-word keyword matching over free text
//!
//! Task descriptions and prompts are lowercased and split into words on
//! anything that is not alphanumeric or `-`, so "decode" never matches
//! `code` and "multi-step" stays one word.

/// Lowercased words of a piece of text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Words {
    words: Vec<String>,
}

impl Words {
    /// Split `text` into words
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            words: split(&text.to_lowercase()),
        }
    }

    /// Whether any of `options` appears as a whole word
    #[must_use]
    pub fn any(&self, options: &[&str]) -> bool {
        self.words.iter().any(|w| options.contains(&w.as_str()))
    }

    /// Whether `phrase` appears as consecutive whole words
    #[must_use]
    pub fn contains_phrase(&self, phrase: &str) -> bool {
        let needle = split(&phrase.to_lowercase());
        if needle.is_empty() || needle.len() > self.words.len() {
            return false;
        }
        self.words.windows(needle.len()).any(|window| window == needle.as_slice())
    }

    /// Whether any of `phrases` appears
    #[must_use]
    pub fn any_phrase(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| self.contains_phrase(p))
    }
}

fn split(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}
