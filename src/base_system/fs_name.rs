//! Filesystem-safe names for title directories.

use unicode_normalization::UnicodeNormalization;

/// Replace characters that are forbidden in file names (Windows being the
/// strictest) with fullwidth lookalikes, strip control characters, and trim
/// trailing dots and spaces.
pub fn safe_fs_name(name: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' => '：',
            '"' => '＂',
            '<' => '《',
            '>' => '》',
            '/' | '\\' => '、',
            '|' => '｜',
            '?' => '？',
            '*' => '＊',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    while cleaned.ends_with('.') || cleaned.ends_with(' ') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        cleaned.push('_');
    }

    if max_len > 0 && cleaned.chars().count() > max_len {
        cleaned = cleaned.chars().take(max_len).collect();
    }
    cleaned
}

/// Canonical directory name for a title: compatibility-equivalence normalised
/// and made filesystem safe.
pub fn title_dir(title: &str) -> String {
    safe_fs_name(&title.nfkc().collect::<String>(), 120)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_characters_are_replaced() {
        assert_eq!(safe_fs_name("a/b:c?", 0), "a、b：c？");
        assert_eq!(safe_fs_name("name...", 0), "name");
        assert_eq!(safe_fs_name("", 0), "_");
    }

    #[test]
    fn titles_are_compatibility_normalised() {
        // fullwidth digits and half-width katakana fold to their canonical forms
        assert_eq!(title_dir("ＡＢＣ１２３"), "ABC123");
        assert_eq!(title_dir("ﾃｽﾄ"), "テスト");
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(300);
        assert_eq!(safe_fs_name(&long, 120).chars().count(), 120);
    }
}
