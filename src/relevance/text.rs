use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How strictly a title must match the keyword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    /// Any significant keyword token in the title is enough. The image stage
    /// is where precision comes from.
    #[default]
    Relaxed,
    /// Every significant token must be present and the title must not name an
    /// unrelated product category.
    Strict,
}

impl FromStr for TextMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relaxed" => Ok(TextMode::Relaxed),
            "strict" => Ok(TextMode::Strict),
            other => Err(format!("unknown text filter mode `{other}`")),
        }
    }
}

/// A category word that sinks a title in strict mode unless one of `unless`
/// also appears in it.
struct Denied {
    term: &'static str,
    unless: &'static [&'static str],
}

const DENYLIST: &[Denied] = &[
    Denied { term: "dog", unless: &["throw", "blanket"] },
    Denied { term: "cat", unless: &["throw", "blanket"] },
    Denied { term: "pet", unless: &["throw", "blanket"] },
    Denied { term: "collar", unless: &[] },
    Denied { term: "leash", unless: &[] },
    Denied { term: "litter", unless: &[] },
    Denied { term: "baby", unless: &["blanket", "swaddle"] },
    Denied { term: "diaper", unless: &[] },
    Denied { term: "phone", unless: &[] },
    Denied { term: "case", unless: &["pillow"] },
    Denied { term: "charger", unless: &[] },
    Denied { term: "earring", unless: &[] },
    Denied { term: "necklace", unless: &[] },
    Denied { term: "car", unless: &[] },
    Denied { term: "toy", unless: &[] },
    Denied { term: "costume", unless: &[] },
];

/// Tokens of `keyword` that carry meaning: lowercased, whitespace separated,
/// longer than two characters.
pub fn significant_tokens(keyword: &str) -> Vec<String> {
    keyword
        .split_whitespace()
        .map(|token| token.to_lowercase())
        .filter(|token| token.chars().count() > 2)
        .collect()
}

pub fn relevant(title: &str, keyword: &str, mode: TextMode) -> bool {
    let title = title.to_lowercase();
    let mut tokens = significant_tokens(keyword);
    if tokens.is_empty() {
        // Keywords made only of short words ("tv", "hd tv") still match as a phrase.
        let phrase = keyword.trim().to_lowercase();
        if phrase.is_empty() {
            return false;
        }
        tokens.push(phrase);
    }

    match mode {
        TextMode::Relaxed => tokens.iter().any(|token| title.contains(token.as_str())),
        TextMode::Strict => {
            tokens.iter().all(|token| title.contains(token.as_str()))
                && !denied(&title, &tokens)
        }
    }
}

fn denied(title: &str, keyword_tokens: &[String]) -> bool {
    let words: Vec<&str> = title
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let has_word = |needle: &str| {
        words
            .iter()
            .any(|word| *word == needle || word.strip_suffix('s') == Some(needle))
    };

    DENYLIST.iter().any(|entry| {
        // A shopper searching for "dog bed" wants dog things.
        if keyword_tokens.iter().any(|token| token == entry.term) {
            return false;
        }
        has_word(entry.term) && !entry.unless.iter().any(|allowed| has_word(allowed))
    })
}
