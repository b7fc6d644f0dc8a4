//! Artifact piece metadata updated as writes complete.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::queue::WriteResult;

/// Size and checksum reported for one finished write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceMetadataUpdate {
  pub bytes: Option<u64>,
  /// `algo:value`, lowercased
  pub checksum: Option<String>,
}

impl PieceMetadataUpdate {
  pub fn from_result(result: &WriteResult, bytes: Option<u64>) -> Self {
    Self {
      bytes,
      checksum: normalize_checksum(
        result.checksum.as_deref(),
        result.checksum_algo.as_deref(),
        result.checksum_hash.as_deref(),
      ),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_none() && self.checksum.is_none()
  }
}

/// `algo:value` from separate parts, or a pre-formatted hash that already
/// carries its algorithm prefix.
pub fn normalize_checksum(checksum: Option<&str>, algo: Option<&str>, hash: Option<&str>) -> Option<String> {
  fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
  }
  if let (Some(value), Some(algo)) = (non_blank(checksum), non_blank(algo)) {
    return Some(format!("{algo}:{value}").to_lowercase());
  }
  non_blank(hash)
    .filter(|hash| hash.contains(':'))
    .map(str::to_lowercase)
}

/// Receives metadata for completed writes.
pub trait PieceMetadataSink: Send + Sync {
  fn update_piece(&self, label: &str, update: &PieceMetadataUpdate);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceEntry {
  pub path: String,
  pub bytes: Option<u64>,
  pub checksum: Option<String>,
}

/// In-memory piece registry keyed by label. Only registered pieces are
/// updated; writes for unknown labels are ignored.
#[derive(Debug, Default)]
pub struct PieceRegistry {
  pieces: DashMap<String, PieceEntry>,
}

impl PieceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, label: impl Into<String>) {
    let label = label.into();
    self.pieces.entry(label.clone()).or_insert_with(|| PieceEntry {
      path: label,
      ..Default::default()
    });
  }

  pub fn get(&self, label: &str) -> Option<PieceEntry> {
    self.pieces.get(label).map(|entry| entry.clone())
  }

  pub fn entries(&self) -> BTreeMap<String, PieceEntry> {
    self
      .pieces
      .iter()
      .map(|entry| (entry.key().clone(), entry.value().clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.pieces.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pieces.is_empty()
  }
}

impl PieceMetadataSink for PieceRegistry {
  fn update_piece(&self, label: &str, update: &PieceMetadataUpdate) {
    let Some(mut entry) = self.pieces.get_mut(label) else {
      return;
    };
    if let Some(bytes) = update.bytes {
      entry.bytes = Some(bytes);
    }
    if let Some(checksum) = &update.checksum {
      entry.checksum = Some(checksum.clone());
    }
  }
}
