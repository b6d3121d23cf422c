use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

/// Cleans user text before it is broadcast. An empty result means "drop it".
pub trait TextSanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://\S+").expect("valid regex"));

/// Strips links and masks configured words with `*`.
#[derive(Debug, Default, Clone)]
pub struct BasicSanitizer {
    /// Case-insensitive alternation of every word, longest first. None when no words are configured.
    profanity: Option<Regex>,
}

impl BasicSanitizer {
    pub fn new<I, S>(words: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut words: Vec<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return Ok(Self::default());
        }

        // Longest first so a word wins over its own prefix at the same start.
        words.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));
        let pattern = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let profanity = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            profanity: Some(profanity),
        })
    }

    fn mask(&self, text: &str) -> String {
        let Some(re) = &self.profanity else {
            return text.to_string();
        };

        // Matches may overlap, so search again from every char inside a hit.
        let mut hit = vec![false; text.len()];
        let mut pos = 0;
        while let Some(m) = re.find_at(text, pos) {
            hit[m.range()].fill(true);
            pos = m.start()
                + text[m.start()..]
                    .chars()
                    .next()
                    .map_or(1, char::len_utf8);
            if pos >= text.len() {
                break;
            }
        }

        text.char_indices()
            .map(|(i, c)| if hit[i] { '*' } else { c })
            .collect()
    }
}

impl TextSanitizer for BasicSanitizer {
    fn sanitize(&self, text: &str) -> String {
        let without_links = URL_RE.replace_all(text, "");
        self.mask(without_links.trim())
    }
}
