//! 外部输入清洗：去掉控制字符（保留换行与制表符），超长截断

pub const MAX_INPUT_CHARS: usize = 10_000;

const TRUNCATION_MARKER: &str = "... [truncated]";

pub fn sanitize_input(input: &str, max_chars: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.chars().count() > max_chars {
        let mut s: String = cleaned.chars().take(max_chars).collect();
        s.push_str(TRUNCATION_MARKER);
        s
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_control_characters() {
        assert_eq!(sanitize_input("hi\u{0007}\u{001b}[0m there\n", 100), "hi[0m there");
        assert_eq!(sanitize_input("a\tb\nc", 100), "a\tb\nc");
    }

    #[test]
    fn test_truncates_long_input() {
        let out = sanitize_input(&"x".repeat(50), 10);
        assert_eq!(out, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
    }
}
