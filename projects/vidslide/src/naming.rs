use regex::{Captures, Regex};

lazy_static::lazy_static! {
    // Ordered by priority: the first pattern found in the name wins.
    static ref ORDINAL: Regex = Regex::new(r"(第)(\d+)([节章课讲部分])").unwrap();
    static ref PARENTHESIZED: Regex = Regex::new(r"([（(])(\d+)([)）])").unwrap();
    static ref SEPARATED: Regex = Regex::new(r"([_\-])(\d+)\s*$").unwrap();
    static ref TRAILING: Regex = Regex::new(r"(\d+)\s*$").unwrap();
    static ref UNSAFE_CHARS: Regex = Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap();
}

const MAX_DIRNAME_CHARS: usize = 80;

#[derive(Clone, Copy)]
enum Pattern {
    Ordinal,
    Parenthesized,
    Separated,
    Trailing,
}

impl Pattern {
    fn regex(self) -> &'static Regex {
        match self {
            Pattern::Ordinal => &ORDINAL,
            Pattern::Parenthesized => &PARENTHESIZED,
            Pattern::Separated => &SEPARATED,
            Pattern::Trailing => &TRAILING,
        }
    }

    fn digits<'h>(self, caps: &Captures<'h>) -> &'h str {
        let group = match self {
            Pattern::Trailing => 1,
            _ => 2,
        };
        caps.get(group).map(|m| m.as_str()).unwrap_or("")
    }

    /// Replacement text for the matched span carrying `num`.
    fn render(self, caps: &Captures, num: u64) -> String {
        let group = |i| caps.get(i).map(|m| m.as_str()).unwrap_or("");
        match self {
            Pattern::Ordinal | Pattern::Parenthesized => {
                format!("{}{}{}", group(1), num, group(3))
            }
            Pattern::Separated => {
                format!("{}{:0width$}", group(1), num, width = group(2).len())
            }
            Pattern::Trailing => format!("{:0width$}", num, width = group(1).len()),
        }
    }
}

/// Generates `count` display names continuing the numbering found in `base`.
///
/// `数学_第1节` becomes `数学_第1节, 数学_第2节, …`; `lecture_01` keeps its
/// zero padding; a name without a number gets `_2`, `_3`, … appended.
pub fn auto_increment_name(base: &str, count: usize) -> Vec<String> {
    match count {
        0 => return Vec::new(),
        1 => return vec![base.to_string()],
        _ => {}
    }

    let patterns = [
        Pattern::Ordinal,
        Pattern::Parenthesized,
        Pattern::Separated,
        Pattern::Trailing,
    ];
    for pattern in patterns {
        let Some(caps) = pattern.regex().captures(base) else {
            continue;
        };
        let Ok(start) = pattern.digits(&caps).parse::<u64>() else {
            continue;
        };
        let Some(span) = caps.get(0) else {
            continue;
        };
        return (0..count as u64)
            .map(|i| {
                format!(
                    "{}{}{}",
                    &base[..span.start()],
                    pattern.render(&caps, start + i),
                    &base[span.end()..]
                )
            })
            .collect();
    }

    std::iter::once(base.to_string())
        .chain((2..=count).map(|i| format!("{}_{}", base, i)))
        .collect()
}

/// Turns a display name into a directory name that is valid on every
/// platform. A non-empty `suffix` is appended after an underscore.
pub fn sanitize_dirname(name: &str, suffix: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(name, "_");
    let trimmed = replaced.trim().trim_matches('.');
    let truncated: String = trimmed.chars().take(MAX_DIRNAME_CHARS).collect();
    let mut safe = truncated.trim_end_matches(['.', ' ']).to_string();
    if safe.is_empty() {
        safe = "unnamed".to_string();
    }
    if !suffix.is_empty() {
        safe = format!("{}_{}", safe, suffix);
    }
    safe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chinese_ordinal() {
        assert_eq!(
            auto_increment_name("数学_第1节", 3),
            vec!["数学_第1节", "数学_第2节", "数学_第3节"]
        );
    }

    #[test]
    fn test_parenthesized() {
        assert_eq!(
            auto_increment_name("Physics (9) intro", 2),
            vec!["Physics (9) intro", "Physics (10) intro"]
        );
        assert_eq!(auto_increment_name("讲座（2）", 2), vec!["讲座（2）", "讲座（3）"]);
    }

    #[test]
    fn test_separator_keeps_padding() {
        assert_eq!(
            auto_increment_name("lecture_08", 3),
            vec!["lecture_08", "lecture_09", "lecture_10"]
        );
        assert_eq!(auto_increment_name("part-3", 2), vec!["part-3", "part-4"]);
    }

    #[test]
    fn test_trailing_digits() {
        assert_eq!(auto_increment_name("week007", 2), vec!["week007", "week008"]);
    }

    #[test]
    fn test_no_number_appends_suffix() {
        assert_eq!(
            auto_increment_name("intro", 3),
            vec!["intro", "intro_2", "intro_3"]
        );
        assert!(auto_increment_name("intro", 0).is_empty());
        assert_eq!(auto_increment_name("第1节", 1), vec!["第1节"]);
    }

    #[test]
    fn test_sanitize_dirname() {
        assert_eq!(sanitize_dirname("a<b>:c?", ""), "a_b__c_");
        assert_eq!(sanitize_dirname("  ..hidden.. ", "x1"), "hidden_x1");
        assert_eq!(sanitize_dirname("...", ""), "unnamed");
        assert_eq!(sanitize_dirname("线性代数/第3讲", "ab12"), "线性代数_第3讲_ab12");
        let long = "长".repeat(100);
        assert_eq!(sanitize_dirname(&long, "").chars().count(), 80);
    }
}
