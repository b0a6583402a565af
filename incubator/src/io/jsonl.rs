//! JSON Lines backing files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::fsutil::write_atomic;

/// Proof that a backing file was fully written and synced to disk.
///
/// Only [`write_jsonl_durable`] can produce one, which is what lets the
/// checkpoint store require it before marking a stage complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableFile {
    path: PathBuf,
    records: usize,
}

impl DurableFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> usize {
        self.records
    }
}

/// Write one JSON record per line, replacing the file atomically.
pub fn write_jsonl_durable<T: Serialize>(path: &Path, records: &[T]) -> Result<DurableFile> {
    let mut buf = String::new();
    for (index, record) in records.iter().enumerate() {
        let line = serde_json::to_string(record)
            .with_context(|| format!("serialize record {index} for {}", path.display()))?;
        buf.push_str(&line);
        buf.push('\n');
    }
    write_atomic(path, buf.as_bytes())?;
    Ok(DurableFile {
        path: path.to_path_buf(),
        records: records.len(),
    })
}

/// Read every record of a JSON Lines file. Blank lines are skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageOutputRecord;
    use serde_json::json;

    #[test]
    fn writes_one_record_per_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stage2_final_plans.jsonl");
        let records = vec![
            StageOutputRecord::new("openai", 2, json!({"idea_id": "oa-1"})),
            StageOutputRecord::new("gemini", 0, json!({"idea_id": "gm-1"})),
        ];
        let durable = write_jsonl_durable(&path, &records).expect("write");
        assert_eq!(durable.records(), 2);
        assert_eq!(durable.path(), path.as_path());

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 2);
        let loaded: Vec<StageOutputRecord> = read_jsonl(&path).expect("load");
        assert_eq!(loaded, records);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("broken.jsonl");
        fs::write(&path, "{\"participant\":\"a\",\"payload\":{}}\n\n{oops\n").expect("write");
        let err = read_jsonl::<StageOutputRecord>(&path).expect_err("malformed");
        assert!(err.to_string().contains("line 3"));
    }
}
