//! Reads the current assignment list from a JSON file.

use std::path::{Path, PathBuf};

use refsync_sdk::objects::MatchRecord;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Accepts either a bare array or `{"matches": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum MatchFile {
    List(Vec<MatchRecord>),
    Wrapped { matches: Vec<MatchRecord> },
}

pub struct MatchFileSource {
    path: PathBuf,
}

impl MatchFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn load(&self) -> Result<Vec<MatchRecord>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let file: MatchFile =
            serde_json::from_str(&content).map_err(|source| SourceError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(match file {
            MatchFile::List(matches) | MatchFile::Wrapped { matches } => matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"[{"match_id": 1, "venue": "Nya Parken"}]"#).unwrap();
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            r#"{"matches": [{"match_id": 2}, {"match_id": 3, "round": 7}]}"#,
        )
        .unwrap();

        let matches = MatchFileSource::new(&bare).load().await.unwrap();
        assert_eq!(matches[0].venue, "Nya Parken");

        let matches = MatchFileSource::new(&wrapped).load().await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[1].extra["round"], 7);
    }

    #[tokio::test]
    async fn test_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = MatchFileSource::new(dir.path().join("missing.json"));
        let err = missing.load().await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
        assert!(err.to_string().contains("missing.json"));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{\"matches\": 5}").unwrap();
        let err = MatchFileSource::new(&broken).load().await.unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));
    }
}
