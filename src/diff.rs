use similar::{ChangeTag, TextDiff};

use crate::formats::ChangeRecord;

/// Line diff of two snapshots, emitting only `+`/`-` lines.
pub fn diff(previous: &str, current: &str) -> ChangeRecord {
    let text_diff = TextDiff::from_lines(previous, current);

    let mut diff_text = String::new();
    for change in text_diff.iter_all_changes() {
        let marker = match change.tag() {
            ChangeTag::Equal => continue,
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
        };
        if !diff_text.is_empty() {
            diff_text.push('\n');
        }
        diff_text.push(marker);
        diff_text.push_str(change.value().trim_end_matches(['\r', '\n']));
    }

    ChangeRecord {
        has_changes: !diff_text.is_empty(),
        diff_text,
    }
}
