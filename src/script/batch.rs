//! Splitting scripts into separator-delimited batches.

/// Split `text` at lines consisting solely of `separator`.
///
/// A line is a boundary when, with surrounding whitespace trimmed, it equals
/// `separator` ignoring ASCII case. Boundary lines belong to no batch.
/// Without any boundary the whole input is returned as one batch. After the
/// last boundary, the remainder only becomes a batch if it has
/// non-whitespace content. Adjacent boundaries yield empty batches.
pub fn split(text: &str, separator: &str) -> Vec<String> {
    let separator = separator.trim();
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut saw_boundary = false;

    for line in text.split_inclusive('\n') {
        if line.trim().eq_ignore_ascii_case(separator) {
            batches.push(std::mem::take(&mut current));
            saw_boundary = true;
        } else {
            current.push_str(line);
        }
    }

    if !saw_boundary {
        return vec![text.to_string()];
    }
    if !current.trim().is_empty() {
        batches.push(current);
    }
    batches
}

/// One batch of a script, with its position for progress and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub text: String,
    /// 1-based.
    pub index: usize,
    /// Number of batches in the script.
    pub count: usize,
}

impl Batch {
    pub fn from_script_text(text: &str, separator: &str) -> Vec<Batch> {
        let texts = split(text, separator);
        let count = texts.len();
        texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Batch {
                text,
                index: i + 1,
                count,
            })
            .collect()
    }

    /// Whitespace-only batches are skipped by the runner.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}
