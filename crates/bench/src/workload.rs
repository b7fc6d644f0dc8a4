//! Seeded synthetic workload.
//!
//! The same seed always yields the same labels, sizes, priorities and delays,
//! so two runs of the harness drain an identical queue.

use std::{
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use dispatch::{JobError, Lane, WriteRequest, WriteResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Shape of the generated workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
  pub writes: usize,
  pub seed: u64,
  /// Cap on bytes actually written per artifact; estimates stay nominal
  pub max_bytes: u64,
  /// Upper bound of the simulated per-write latency
  pub max_delay_ms: u64,
  /// Every Nth write is marked eager (0 disables)
  pub eager_every: usize,
}

impl Default for WorkloadSpec {
  fn default() -> Self {
    Self {
      writes: 200,
      seed: 7,
      max_bytes: 4 * MIB,
      max_delay_ms: 40,
      eager_every: 0,
    }
  }
}

/// One generated artifact before it becomes a [`WriteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteProfile {
  pub label: String,
  pub priority: i64,
  pub estimated_bytes: u64,
  pub written_bytes: u64,
  pub delay_ms: u64,
  pub lane_hint: Option<Lane>,
  pub eager: bool,
}

/// splitmix64 step
fn next_random(state: &mut u64) -> u64 {
  *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
  let mut z = *state;
  z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
  z ^ (z >> 31)
}

fn pick_label(idx: usize, roll: u64) -> (String, i64, Option<Lane>) {
  match roll % 20 {
    0 => (format!("pieces/chunk_meta.part-{idx:05}.json"), 5, None),
    1 => (format!("field_postings.shard-{idx:04}.bin"), 0, None),
    2 => (format!("token_postings.packed.{idx:04}"), 0, None),
    3..=5 => (format!("meta/{idx:05}.meta.json"), 0, None),
    6 => (format!("dense_vectors/{idx:05}.bin"), 0, Some(Lane::Heavy)),
    7 => (format!("debug/trace-{idx:05}.json"), -1, None),
    _ => (format!("shards/artifact-{idx:05}.json"), 0, None),
  }
}

fn pick_bytes(roll: u64) -> u64 {
  match roll % 100 {
    0..=39 => 512 + roll % (32 * KIB),
    40..=74 => 64 * KIB + roll % (900 * KIB),
    75..=91 => MIB + roll % (12 * MIB),
    92..=97 => 16 * MIB + roll % (96 * MIB),
    _ => 128 * MIB + roll % (512 * MIB),
  }
}

impl WorkloadSpec {
  /// Deterministic profiles. The validation-critical state file is always first.
  pub fn profiles(&self) -> Vec<WriteProfile> {
    let mut state = self.seed;
    let mut profiles = Vec::with_capacity(self.writes);
    for idx in 0..self.writes {
      let (label, priority, lane_hint) = if idx == 0 {
        ("index_state.json".to_string(), 0, None)
      } else {
        pick_label(idx, next_random(&mut state))
      };
      let estimated_bytes = pick_bytes(next_random(&mut state));
      let delay_ms = match self.max_delay_ms {
        0 => 0,
        max => next_random(&mut state) % (max + 1),
      };
      profiles.push(WriteProfile {
        label,
        priority,
        estimated_bytes,
        written_bytes: estimated_bytes.min(self.max_bytes),
        delay_ms,
        lane_hint,
        eager: self.eager_every > 0 && idx % self.eager_every == 0,
      });
    }
    profiles
  }

  /// Build write requests that materialize each profile under `out_dir`.
  pub fn requests(&self, out_dir: &Path) -> Vec<WriteRequest> {
    self.profiles().into_iter().map(|profile| profile.into_request(out_dir)).collect()
  }
}

impl WriteProfile {
  pub fn into_request(self, out_dir: &Path) -> WriteRequest {
    let path = out_dir.join(&self.label);
    let written_bytes = self.written_bytes;
    let delay = Duration::from_millis(self.delay_ms);
    let mut request = WriteRequest::new(self.label.clone(), move || write_artifact(path, written_bytes, delay))
      .with_priority(self.priority)
      .with_estimated_bytes(self.estimated_bytes);
    if let Some(lane) = self.lane_hint {
      request = request.with_lane_hint(lane);
    }
    if self.eager {
      request = request.eager();
    }
    request
  }
}

/// Deterministic artifact body of `len` bytes.
pub fn artifact_body(label_seed: u64, len: u64) -> Vec<u8> {
  let mut state = label_seed;
  let mut body = Vec::with_capacity(len as usize);
  while (body.len() as u64) < len {
    let word = next_random(&mut state).to_le_bytes();
    let take = (len as usize - body.len()).min(word.len());
    body.extend_from_slice(&word[..take]);
  }
  body
}

async fn write_artifact(path: PathBuf, bytes: u64, delay: Duration) -> Result<WriteResult, JobError> {
  let serialize_started = Instant::now();
  let body = artifact_body(bytes ^ path.as_os_str().len() as u64, bytes);
  let checksum = hex::encode(Sha256::digest(&body));
  let serialization_ms = serialize_started.elapsed().as_secs_f64() * 1000.0;

  let disk_started = Instant::now();
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  tokio::fs::write(&path, &body).await?;
  if !delay.is_zero() {
    tokio::time::sleep(delay).await;
  }

  Ok(WriteResult {
    bytes: Some(body.len() as u64),
    checksum: Some(checksum),
    checksum_algo: Some("sha256".to_string()),
    serialization_ms: Some(serialization_ms),
    disk_ms: Some(disk_started.elapsed().as_secs_f64() * 1000.0),
    ..Default::default()
  })
}
