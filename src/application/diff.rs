use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

pub const TRUNCATION_NOTICE: &str = "\n\n[Diff truncated due to size limits]";

fn file_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^diff --git a/(.+?) b/(.+?)$").expect("file marker regex")
    })
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Removed,
    Renamed,
    Modified,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Renamed => "renamed",
            Self::Modified => "modified",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileDiff {
    pub old_path: String,
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
    /// Hunk body starting at the first `@@` line; empty when the file diff
    /// carries no hunks (binary, pure rename).
    pub patch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkHeader {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
}

/// Splits a unified diff into per-file sections on `diff --git` markers.
pub fn parse_diff(diff: &str) -> Vec<FileDiff> {
    let marker = file_marker_re();
    let starts: Vec<usize> = marker.find_iter(diff).map(|m| m.start()).collect();

    let mut files = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(diff.len());
        if let Some(file) = parse_file_section(&diff[start..end]) {
            files.push(file);
        }
    }
    files
}

fn parse_file_section(section: &str) -> Option<FileDiff> {
    let mut lines = section.lines();
    let header = lines.next()?;
    let caps = file_marker_re().captures(header)?;

    let mut file = FileDiff {
        old_path: caps[1].to_string(),
        path: caps[2].to_string(),
        status: FileStatus::Modified,
        additions: 0,
        deletions: 0,
        patch: String::new(),
    };

    for line in section.lines() {
        if line.starts_with("new file") {
            file.status = FileStatus::Added;
        } else if line.starts_with("deleted file") {
            file.status = FileStatus::Removed;
        } else if line.starts_with("rename from") {
            file.status = FileStatus::Renamed;
        } else if line.starts_with('+') && !line.starts_with("+++") {
            file.additions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            file.deletions += 1;
        }
    }

    if let Some(idx) = section
        .lines()
        .position(|l| l.starts_with("@@"))
    {
        file.patch = section
            .lines()
            .skip(idx)
            .collect::<Vec<_>>()
            .join("\n");
    }

    Some(file)
}

/// Parses `@@ -oldStart[,oldLines] +newStart[,newLines] @@`; omitted counts
/// default to 1.
pub fn parse_hunk_header(line: &str) -> Option<HunkHeader> {
    let caps = hunk_header_re().captures(line)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some(HunkHeader {
        old_start: num(1)?,
        old_lines: num(2).unwrap_or(1),
        new_start: num(3)?,
        new_lines: num(4).unwrap_or(1),
    })
}

/// Computes the new-side line numbers touched by a patch: context and `+`
/// lines advance the cursor, `-` lines do not.
pub fn changed_line_numbers(patch: &str) -> HashSet<u32> {
    let mut changed = HashSet::new();
    let mut current: u32 = 0;

    for line in patch.lines() {
        if line.starts_with("@@") {
            if let Some(hunk) = parse_hunk_header(line) {
                current = hunk.new_start;
            }
            continue;
        }

        if line.starts_with('+') && !line.starts_with("+++") {
            changed.insert(current);
            current = current.saturating_add(1);
        } else if line.starts_with('-') && !line.starts_with("---") {
            // Deleted lines exist only on the old side.
        } else {
            current = current.saturating_add(1);
        }
    }

    changed
}

/// Truncates a raw diff to `max_size` bytes. Prefers the last complete
/// `diff --git` boundary at or under the limit; hard-cuts when no boundary
/// fits. Diffs at or under the limit pass through untouched.
pub fn truncate_diff(diff: &str, max_size: usize) -> String {
    if diff.len() <= max_size {
        return diff.to_string();
    }

    let mut last_boundary = 0;
    for m in file_marker_re().find_iter(diff) {
        if m.start() <= max_size {
            last_boundary = m.start();
        } else {
            break;
        }
    }

    if last_boundary > 0 {
        format!("{}{}", &diff[..last_boundary], TRUNCATION_NOTICE)
    } else {
        let cut = floor_char_boundary(diff, max_size);
        format!("{}{}", &diff[..cut], TRUNCATION_NOTICE)
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "diff --git a/src/lib.rs b/src/lib.rs\n\
index 111..222 100644\n\
--- a/src/lib.rs\n\
+++ b/src/lib.rs\n\
@@ -1,3 +1,4 @@\n\
 fn main() {\n\
+    println!(\"hi\");\n\
     run();\n\
 }\n\
diff --git a/README.md b/README.md\n\
new file mode 100644\n\
--- /dev/null\n\
+++ b/README.md\n\
@@ -0,0 +1,2 @@\n\
+# Title\n\
+Body\n";

    #[test]
    fn splits_files_and_counts_changes() {
        let files = parse_diff(SAMPLE);
        assert_eq!(files.len(), 2);

        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[0].status, FileStatus::Modified);
        assert_eq!(files[0].additions, 1);
        assert_eq!(files[0].deletions, 0);
        assert!(files[0].patch.starts_with("@@ -1,3 +1,4 @@"));

        assert_eq!(files[1].path, "README.md");
        assert_eq!(files[1].status, FileStatus::Added);
        assert_eq!(files[1].additions, 2);
    }

    #[test]
    fn detects_removed_and_renamed_status() {
        let removed = "diff --git a/gone.rs b/gone.rs\ndeleted file mode 100644\n@@ -1 +0,0 @@\n-x\n";
        assert_eq!(parse_diff(removed)[0].status, FileStatus::Removed);

        let renamed = "diff --git a/old.rs b/new.rs\nrename from old.rs\nrename to new.rs\n";
        let files = parse_diff(renamed);
        assert_eq!(files[0].status, FileStatus::Renamed);
        assert_eq!(files[0].old_path, "old.rs");
        assert_eq!(files[0].path, "new.rs");
        assert!(files[0].patch.is_empty());
    }

    #[test]
    fn hunk_header_defaults_omitted_counts_to_one() {
        let hunk = parse_hunk_header("@@ -10 +20 @@").expect("parse");
        assert_eq!(hunk.old_start, 10);
        assert_eq!(hunk.old_lines, 1);
        assert_eq!(hunk.new_start, 20);
        assert_eq!(hunk.new_lines, 1);

        let full = parse_hunk_header("@@ -3,7 +3,9 @@ fn context()").expect("parse");
        assert_eq!(full.old_lines, 7);
        assert_eq!(full.new_start, 3);
        assert_eq!(full.new_lines, 9);

        assert!(parse_hunk_header("not a hunk").is_none());
    }

    #[test]
    fn changed_lines_track_the_new_side() {
        let patch = "@@ -1,3 +1,4 @@\n fn main() {\n+    println!(\"hi\");\n     run();\n }\n";
        let changed = changed_line_numbers(patch);
        assert_eq!(changed, HashSet::from([2]));
    }

    #[test]
    fn changed_lines_reset_cursor_at_each_hunk() {
        let patch = "@@ -1,2 +1,3 @@\n ctx\n+one\n ctx\n@@ -10,2 +11,3 @@\n ctx\n-gone\n+two\n ctx\n";
        let changed = changed_line_numbers(patch);
        assert_eq!(changed, HashSet::from([2, 12]));
    }

    #[test]
    fn diff_at_limit_is_not_truncated() {
        let out = truncate_diff(SAMPLE, SAMPLE.len());
        assert_eq!(out, SAMPLE);
    }

    #[test]
    fn diff_over_limit_cuts_at_file_boundary() {
        let out = truncate_diff(SAMPLE, SAMPLE.len() - 1);
        assert!(out.ends_with(TRUNCATION_NOTICE));
        let kept = out.trim_end_matches(TRUNCATION_NOTICE);
        assert!(kept.ends_with("}\n"), "cut lands on the second file marker");
        assert_eq!(kept.matches("diff --git").count(), 1);
    }

    #[test]
    fn no_fitting_boundary_hard_cuts_at_limit() {
        // Limit of zero means even the first marker is past it.
        let out = truncate_diff(SAMPLE, 0);
        assert_eq!(out, TRUNCATION_NOTICE);

        let mid_first_file = truncate_diff(SAMPLE, 10);
        assert!(mid_first_file.starts_with("diff --git"));
        assert!(mid_first_file.ends_with(TRUNCATION_NOTICE));
    }
}
