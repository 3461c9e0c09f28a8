// Name normalization helpers.
//
// Two distinct canonical forms are in play: the registry equality key
// (accents preserved) and the fuzzy-scoring base (accents stripped).

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonical form used as the registry equality key: Unicode NFC, trimmed,
/// internal whitespace collapsed, lowercased. Diacritics are preserved —
/// "Noé" and "Noe" are different names.
pub fn normalize_name(name: &str) -> String {
    let recomposed: String = name.nfc().collect();
    recomposed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lowercase with diacritics stripped; the base string for edit-distance
/// scoring, where "héloïse" and "heloise" must be identical.
pub fn fold_diacritics(s: &str) -> String {
    s.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

const ACCENT_CLASSES: &[(char, &str)] = &[
    ('a', "[aàáâãäå]"),
    ('c', "[cç]"),
    ('e', "[eèéêë]"),
    ('i', "[iìíîï]"),
    ('n', "[nñ]"),
    ('o', "[oòóôõö]"),
    ('u', "[uùúûü]"),
    ('y', "[yýÿ]"),
];

/// Expand every character into its accent-variant class so a pattern built
/// from "Grégorio" also matches "Gregorio" and vice versa. Case folding is
/// left to the `(?i)` flag at the call site.
pub fn accent_insensitive_pattern(s: &str) -> String {
    let mut pattern = String::with_capacity(s.len() * 4);
    for ch in s.chars() {
        let base = std::iter::once(ch)
            .nfd()
            .find(|c| !is_combining_mark(*c))
            .unwrap_or(ch);
        let base = base.to_lowercase().next().unwrap_or(base);
        match ACCENT_CLASSES.iter().find(|(b, _)| *b == base) {
            Some((_, class)) => pattern.push_str(class),
            None => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern
}
