use std::collections::BTreeSet;

/// Case-insensitive containment of each configured keyword in `text`.
/// Blank keywords are ignored; hits are reported trimmed.
pub fn match_keywords(text: &str, keywords: &BTreeSet<String>) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    if keywords.is_empty() {
        return found;
    }

    let haystack = text.to_lowercase();
    for keyword in keywords {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            continue;
        }
        if haystack.contains(&keyword.to_lowercase()) {
            found.insert(keyword.to_owned());
        }
    }
    found
}
