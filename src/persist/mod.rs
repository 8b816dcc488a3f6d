//! Atomic JSON file persistence: write to `${path}.tmp` then rename onto
//! `${path}` so readers never observe a partial file (spec.md §4.3, §4.10).

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

pub async fn save_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let tmp_path = tmp_path_for(path);
    let bytes = serde_json::to_vec_pretty(value).context("serializing snapshot")?;
    tokio::fs::write(&tmp_path, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {} onto {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Best-effort load: a missing or corrupt file yields `None` rather than an
/// error so callers can degrade to a default snapshot (spec.md §4.3).
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "corrupt snapshot, using default");
            None
        }
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

/// Append one JSON-encoded record followed by `\n` to a JSONL file,
/// creating parent directories as needed (spec.md §4.11).
pub async fn append_jsonl<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_vec(value).context("serializing record")?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(&line)
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Tail a JSONL file from the end, collecting up to `limit` valid records.
/// Robust to a partial final line and to malformed lines interspersed
/// (spec.md §4.11).
pub fn tail_jsonl<T: DeserializeOwned>(path: &Path, limit: usize) -> Vec<T> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in contents.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<T>(line) {
            out.push(record);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Rec {
        id: u32,
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.json");
        save_json(&path, &Rec { id: 7 }).await.unwrap();
        let loaded: Rec = load_json(&path).await.unwrap();
        assert_eq!(loaded, Rec { id: 7 });
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn load_missing_file_is_none() {
        let path = Path::new("/nonexistent/path/does-not-exist.json");
        let loaded: Option<Rec> = load_json(path).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn append_and_tail_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        for id in 0..5u32 {
            append_jsonl(&path, &Rec { id }).await.unwrap();
        }
        // simulate a malformed trailing partial line
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"id\":").await.unwrap();

        let tail: Vec<Rec> = tail_jsonl(&path, 3);
        assert_eq!(tail, vec![Rec { id: 4 }, Rec { id: 3 }, Rec { id: 2 }]);
    }
}
