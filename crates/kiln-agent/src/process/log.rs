use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-capacity ring of captured output lines.
#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// The last `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| {
                let skip = lines.len().saturating_sub(count);
                lines.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn any_line(&self, predicate: impl Fn(&str) -> bool) -> bool {
        self.lines
            .lock()
            .map(|lines| lines.iter().any(|line| predicate(line)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_lines_are_evicted_at_capacity() {
        let buffer = LogBuffer::new(3);
        for n in 0..5 {
            buffer.push(format!("line {n}"));
        }
        assert_eq!(buffer.tail(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.tail(1), vec!["line 4"]);
        assert!(buffer.any_line(|line| line.ends_with('3')));
        assert!(!buffer.any_line(|line| line.ends_with('0')));
    }
}
