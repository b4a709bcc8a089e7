//! LLM transcript recording and deterministic replay.
//!
//! During live play a [`TranscriptRecorder`] captures every completion as a
//! `(agent_id, call_sequence)` keyed JSONL entry. A later run can wrap its
//! agents in [`ReplayLlmClient`]s fed from the same transcript: together with
//! a fixed dice seed the session replays identically. [`HybridLlmClient`]
//! switches from cached to live responses at a configured round boundary so
//! a recorded session can be continued interactively.

use crate::voidtable::llm::{LlmClient, LlmError, LlmRequest, LlmResponse};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One recorded completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub agent_id: String,
    pub call_sequence: usize,
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub round: Option<u32>,
}

/// Appends transcript entries to a JSONL file.
pub struct TranscriptRecorder {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl TranscriptRecorder {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &TranscriptEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| io::Error::other(format!("failed to serialize transcript entry: {}", e)))?;
        let mut file = self.file.lock().expect("transcript file poisoned");
        writeln!(file, "{}", line)
    }
}

/// The in-memory transcript cache keyed by `(agent_id, call_sequence)`.
#[derive(Default, Clone)]
pub struct TranscriptCache {
    entries: HashMap<(String, usize), TranscriptEntry>,
}

impl TranscriptCache {
    /// Load a transcript file, optionally truncated to calls at or before
    /// `replay_to_round` (entries with no round always load).
    pub fn load(path: &Path, replay_to_round: Option<u32>) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(&line) {
                Ok(entry) => {
                    if let (Some(limit), Some(round)) = (replay_to_round, entry.round) {
                        if round > limit {
                            continue;
                        }
                    }
                    entries.insert((entry.agent_id.clone(), entry.call_sequence), entry);
                }
                Err(e) => warn!("skipping unreadable transcript line: {}", e),
            }
        }
        info!("loaded {} transcript entries from {}", entries.len(), path.display());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, agent_id: &str, call_sequence: usize) -> Option<&TranscriptEntry> {
        self.entries.get(&(agent_id.to_string(), call_sequence))
    }

    /// Sanity check: per-agent call sequences must be gap-free from zero.
    pub fn validate_completeness(&self) -> serde_json::Value {
        let mut per_agent: HashMap<&str, Vec<usize>> = HashMap::new();
        for (agent_id, seq) in self.entries.keys() {
            per_agent.entry(agent_id.as_str()).or_default().push(*seq);
        }
        let mut gaps = Vec::new();
        for (agent, mut seqs) in per_agent {
            seqs.sort_unstable();
            for (expected, actual) in seqs.iter().enumerate() {
                if *actual != expected {
                    gaps.push(json!({"agent": agent, "missing": expected}));
                    break;
                }
            }
        }
        json!({"complete": gaps.is_empty(), "gaps": gaps})
    }
}

/// Wraps any client, recording every completion under this agent's id.
pub struct RecordingLlmClient {
    inner: Arc<dyn LlmClient>,
    recorder: Arc<TranscriptRecorder>,
    agent_id: String,
    call_sequence: AtomicUsize,
    current_round: Arc<AtomicU32>,
}

impl RecordingLlmClient {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        recorder: Arc<TranscriptRecorder>,
        agent_id: &str,
        current_round: Arc<AtomicU32>,
    ) -> Self {
        Self {
            inner,
            recorder,
            agent_id: agent_id.to_string(),
            call_sequence: AtomicUsize::new(0),
            current_round,
        }
    }
}

#[async_trait]
impl LlmClient for RecordingLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let seq = self.call_sequence.fetch_add(1, Ordering::SeqCst);
        let response = self.inner.complete(request.clone()).await?;
        let round = self.current_round.load(Ordering::SeqCst);
        let entry = TranscriptEntry {
            agent_id: self.agent_id.clone(),
            call_sequence: seq,
            prompt: request.prompt,
            response: response.content.clone(),
            model: self.inner.model_name().to_string(),
            temperature: request.temperature,
            round: if round > 0 { Some(round) } else { None },
        };
        if let Err(e) = self.recorder.record(&entry) {
            warn!("failed to record transcript entry: {}", e);
        }
        Ok(response)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Serves cached responses for one agent by call sequence. Misses are hard
/// errors: a replay that diverges from its transcript is a bug.
pub struct ReplayLlmClient {
    cache: Arc<TranscriptCache>,
    agent_id: String,
    call_sequence: AtomicUsize,
}

impl ReplayLlmClient {
    pub fn new(cache: Arc<TranscriptCache>, agent_id: &str) -> Self {
        Self {
            cache,
            agent_id: agent_id.to_string(),
            call_sequence: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for ReplayLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let seq = self.call_sequence.fetch_add(1, Ordering::SeqCst);
        match self.cache.get(&self.agent_id, seq) {
            Some(entry) => Ok(LlmResponse {
                content: entry.response.clone(),
                usage: None,
            }),
            None => Err(LlmError::CacheMiss(format!("({}, {})", self.agent_id, seq))),
        }
    }

    fn model_name(&self) -> &str {
        "replay"
    }
}

/// Replays from cache through `continue_from_round`, then switches to the
/// live client.
pub struct HybridLlmClient {
    cache: Arc<TranscriptCache>,
    live: Arc<dyn LlmClient>,
    agent_id: String,
    call_sequence: AtomicUsize,
    current_round: Arc<AtomicU32>,
    continue_from_round: u32,
}

impl HybridLlmClient {
    pub fn new(
        cache: Arc<TranscriptCache>,
        live: Arc<dyn LlmClient>,
        agent_id: &str,
        current_round: Arc<AtomicU32>,
        continue_from_round: u32,
    ) -> Self {
        Self {
            cache,
            live,
            agent_id: agent_id.to_string(),
            call_sequence: AtomicUsize::new(0),
            current_round,
            continue_from_round,
        }
    }
}

#[async_trait]
impl LlmClient for HybridLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let round = self.current_round.load(Ordering::SeqCst);
        if round < self.continue_from_round {
            let seq = self.call_sequence.fetch_add(1, Ordering::SeqCst);
            if let Some(entry) = self.cache.get(&self.agent_id, seq) {
                return Ok(LlmResponse {
                    content: entry.response.clone(),
                    usage: None,
                });
            }
            warn!(
                "hybrid replay miss at ({}, {}) in round {} — going live",
                self.agent_id, seq, round
            );
        }
        self.live.complete(request).await
    }

    fn model_name(&self) -> &str {
        self.live.model_name()
    }
}
