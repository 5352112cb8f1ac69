//! Rule splitting
//!
//! Partitions a rules file into N sub-files so a single (wordlist, rules)
//! combination can run data-parallel across agents. Sub-file sizes are
//! balanced within one line. Files are content-addressed (sha256 of bytes)
//! and cached in the chunk directory, so identical splits are reused across
//! jobs and concurrent readers are safe.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::types::{RuleChunkRef, RuleSplitError};

/// One rule sub-file produced by a split.
#[derive(Debug, Clone)]
pub struct RuleChunk {
    /// Content hash of the sub-file bytes; doubles as the cache key.
    pub id: String,
    pub path: PathBuf,
    pub index: u32,
    pub line_count: i64,
}

impl RuleChunk {
    pub fn as_ref(&self) -> RuleChunkRef {
        RuleChunkRef {
            index: self.index,
            chunk_id: self.id.clone(),
            line_count: self.line_count,
        }
    }
}

/// Splits rule files into balanced, content-addressed sub-files.
#[derive(Debug, Clone)]
pub struct RuleSplitter {
    chunk_dir: PathBuf,
}

impl RuleSplitter {
    pub fn new(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
        }
    }

    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }

    /// Split `rules_path` into `chunk_count` sub-files.
    ///
    /// Rule lines are distributed in order: with `n = lines` and
    /// `k = chunk_count`, the first `n % k` chunks get `n / k + 1` lines and
    /// the rest get `n / k`, so sizes differ by at most one line.
    pub async fn split(
        &self,
        rules_path: &Path,
        chunk_count: u32,
    ) -> Result<Vec<RuleChunk>, RuleSplitError> {
        let content = tokio::fs::read_to_string(rules_path).await?;
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Err(RuleSplitError::EmptyRules);
        }
        let chunk_count = chunk_count.max(1) as usize;
        if chunk_count > lines.len() {
            return Err(RuleSplitError::TooManyChunks {
                requested: chunk_count as u32,
                rules: lines.len(),
            });
        }

        tokio::fs::create_dir_all(&self.chunk_dir).await?;

        let base = lines.len() / chunk_count;
        let extra = lines.len() % chunk_count;

        let mut chunks = Vec::with_capacity(chunk_count);
        let mut offset = 0usize;
        for index in 0..chunk_count {
            let take = base + usize::from(index < extra);
            let slice = &lines[offset..offset + take];
            offset += take;

            let mut body = slice.join("\n");
            body.push('\n');

            let id = content_hash(body.as_bytes());
            let path = self.chunk_dir.join(format!("{}.rule", id));

            // Content-addressed: an existing file already holds these bytes.
            if !path.exists() {
                tokio::fs::write(&path, body.as_bytes()).await?;
            }

            chunks.push(RuleChunk {
                id,
                path,
                index: index as u32,
                line_count: take as i64,
            });
        }

        Ok(chunks)
    }

    /// Path a previously produced chunk lives at.
    pub fn chunk_path(&self, chunk_id: &str) -> PathBuf {
        self.chunk_dir.join(format!("{}.rule", chunk_id))
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
