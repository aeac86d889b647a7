#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationMode {
    HeadTail,
    Tail,
}

/// Log-like output keeps its end; everything else keeps both ends.
pub fn truncation_mode_for_tool(tool_name: &str) -> TruncationMode {
    match tool_name {
        "server.logs" | "tests.run" => TruncationMode::Tail,
        _ => TruncationMode::HeadTail,
    }
}

pub fn truncate_tool_output(output: &str, tool_name: &str, max_chars: usize) -> String {
    truncate_chars(output, max_chars, truncation_mode_for_tool(tool_name))
}

pub fn truncate_chars(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    let char_count = output.chars().count();
    if char_count <= max_chars {
        return output.to_string();
    }

    let removed = char_count - max_chars;
    match mode {
        TruncationMode::HeadTail => {
            let head = max_chars / 2;
            let tail = max_chars - head;
            format!(
                "{}\n[... {removed} characters omitted; the full result is in the session history ...]\n{}",
                take_head(output, head),
                take_tail(output, tail)
            )
        }
        TruncationMode::Tail => format!(
            "[... first {removed} characters omitted ...]\n{}",
            take_tail(output, max_chars)
        ),
    }
}

fn take_head(input: &str, char_count: usize) -> String {
    input.chars().take(char_count).collect()
}

fn take_tail(input: &str, char_count: usize) -> String {
    let total = input.chars().count();
    input.chars().skip(total.saturating_sub(char_count)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_chars("abc", 10, TruncationMode::HeadTail), "abc");
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let output = truncate_chars("abcdefghij", 4, TruncationMode::HeadTail);
        assert!(output.starts_with("ab\n"));
        assert!(output.ends_with("\nij"));
        assert!(output.contains("6 characters omitted"));
    }

    #[test]
    fn logs_keep_their_tail() {
        let output = truncate_tool_output("line1\nline2\nline3", "server.logs", 5);
        assert!(output.ends_with("line3"));
        assert!(output.starts_with("[... first"));
    }

    #[test]
    fn multibyte_characters_are_not_split() {
        let output = truncate_chars("ééééé", 2, TruncationMode::Tail);
        assert!(output.ends_with("éé"));
    }
}
