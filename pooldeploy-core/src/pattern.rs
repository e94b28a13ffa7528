//! Case-insensitive `*` / `?` wildcard matching for exclude patterns.
//!
//! Patterns are matched against both the bare file name and the full path,
//! with `\` normalised to `/` on both sides so Windows-style patterns such as
//! `*\obj\*` behave the same as `*/obj/*`.

use std::path::Path;

/// Compiled set of exclude patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeSet {
    patterns: Vec<Vec<char>>,
}

impl ExcludeSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// `true` when any pattern matches the file name or the full path.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let full = normalize(&path.to_string_lossy());
        let name = path
            .file_name()
            .map(|n| normalize(&n.to_string_lossy()))
            .unwrap_or_default();
        self.patterns
            .iter()
            .any(|pattern| wildcard_match(pattern, &name) || wildcard_match(pattern, &full))
    }
}

fn normalize(text: &str) -> Vec<char> {
    text.chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .flat_map(char::to_lowercase)
        .collect()
}

/// Iterative glob match with single-star backtracking.
fn wildcard_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_text = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("*.tmp", "/src/app1/a.tmp", true)]
    #[case("*.tmp", "/src/app1/A.TMP", true)]
    #[case("*.tmp", "/src/app1/a.txt", false)]
    #[case("~$*", "/src/app1/~$report.docx", true)]
    #[case("a?.txt", "/src/app1/ab.txt", true)]
    #[case("a?.txt", "/src/app1/abc.txt", false)]
    #[case("*/obj/*", "/src/app1/obj/debug/x.dll", true)]
    #[case("*\\obj\\*", "/src/app1/obj/debug/x.dll", true)]
    #[case("/src/app1/logs/*", "/src/app1/logs/today.log", true)]
    #[case("web.config", "/src/app1/Web.Config", true)]
    fn matches_name_or_full_path(#[case] pattern: &str, #[case] path: &str, #[case] expected: bool) {
        let set = ExcludeSet::new([pattern]);
        assert_eq!(set.is_excluded(Path::new(path)), expected, "{pattern} vs {path}");
    }

    #[test]
    fn empty_set_excludes_nothing() {
        let set = ExcludeSet::new(Vec::<String>::new());
        assert!(set.is_empty());
        assert!(!set.is_excluded(Path::new("/src/a.tmp")));
    }

    #[test]
    fn blank_patterns_are_ignored() {
        let set = ExcludeSet::new(["", "*.log"]);
        assert!(!set.is_excluded(Path::new("/src/a.txt")));
        assert!(set.is_excluded(Path::new("/src/a.log")));
    }
}
