//! Parser for `git status --porcelain=v1 -z`

/// One record of porcelain status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Index (staged) status column
    pub index: char,
    /// Worktree status column
    pub worktree: char,
    /// Path, relative to the repository root
    pub path: String,
    /// Source path of a rename or copy
    pub orig_path: Option<String>,
}

impl StatusEntry {
    /// Whether either column is `code`
    pub fn has(&self, code: char) -> bool {
        self.index == code || self.worktree == code
    }
}

/// Parse NUL-separated porcelain v1 output
///
/// Records are `XY path\0`; renames and copies carry their source as the
/// following `orig\0` field. Malformed records are skipped.
pub fn parse_porcelain_z(output: &str) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    let mut fields = output.split('\0');

    while let Some(field) = fields.next() {
        if field.is_empty() {
            continue;
        }
        let mut chars = field.chars();
        let (Some(index), Some(worktree), Some(' ')) = (chars.next(), chars.next(), chars.next())
        else {
            tracing::debug!(record = %field, "Skipping malformed porcelain record");
            continue;
        };
        let path = chars.as_str().to_string();
        if path.is_empty() {
            continue;
        }

        let orig_path = if matches!(index, 'R' | 'C') || matches!(worktree, 'R' | 'C') {
            fields.next().filter(|s| !s.is_empty()).map(str::to_string)
        } else {
            None
        };

        entries.push(StatusEntry {
            index,
            worktree,
            path,
            orig_path,
        });
    }

    entries
}
