//! Compatibility oracles for needs/offers scoring.
//!
//! An oracle maps a needs list and an offers list to a score in `[0, 1]`.
//! `KeywordOracle` is a cheap lexical baseline, `EmbeddingOracle` wraps any
//! `Embedder` (the seeded `HashEmbedder` or Ollama's embedding API).

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Scores how well `offers` satisfies `needs`.
///
/// Must be deterministic for a given input pair. Direction matters: callers
/// score `(a.needs, b.offers)` and `(b.needs, a.offers)` independently.
pub trait CompatibilityOracle: Send + Sync {
    fn score(&self, needs: &[String], offers: &[String]) -> f32;
}

impl<F> CompatibilityOracle for F
where
    F: Fn(&[String], &[String]) -> f32 + Send + Sync,
{
    fn score(&self, needs: &[String], offers: &[String]) -> f32 {
        (self)(needs, offers).clamp(0.0, 1.0)
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Lexical oracle: for each need, the best token-Jaccard match among the
/// offers, averaged over all needs.
#[derive(Clone, Debug, Default)]
pub struct KeywordOracle;

impl KeywordOracle {
    fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let inter = a.intersection(b).count() as f32;
        let union = a.union(b).count() as f32;
        inter / union
    }
}

impl CompatibilityOracle for KeywordOracle {
    fn score(&self, needs: &[String], offers: &[String]) -> f32 {
        if needs.is_empty() || offers.is_empty() {
            return 0.0;
        }
        let offer_sets: Vec<HashSet<String>> = offers.iter().map(|o| tokens(o).collect()).collect();
        let total: f32 = needs
            .iter()
            .map(|need| {
                let ns: HashSet<String> = tokens(need).collect();
                offer_sets
                    .iter()
                    .map(|os| Self::jaccard(&ns, os))
                    .fold(0.0, f32::max)
            })
            .sum();
        total / needs.len() as f32
    }
}

/// Fixed-length vector for similarity scoring.
pub type Embedding = Vec<f32>;

/// Trait for text embedding backends.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Embedding>;
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
    for x in v {
        *x /= norm;
    }
}

/// Cosine similarity between two L2-normalized vectors.
pub fn cosine(a: &Embedding, b: &Embedding) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Seeded hashed-projection embedder. Deterministic, not semantic.
#[derive(Clone, Debug)]
pub struct HashEmbedder {
    dim: usize,
    seed: u64,
}

impl HashEmbedder {
    pub fn new(dim: usize, seed: u64) -> Self {
        Self { dim: dim.max(1), seed }
    }

    fn hash64(&self, s: &str) -> u64 {
        // FNV-1a, seeded
        let mut h = 1469598103934665603u64 ^ self.seed;
        for b in s.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(1099511628211u64);
        }
        h
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128, 42)
    }
}

impl Embedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        let mut v = vec![0f32; self.dim];
        for tok in tokens(text) {
            let h = self.hash64(&tok);
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[(h as usize) % self.dim] += sign;
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

/// Oracle scoring the cosine between the joined needs and the joined offers.
///
/// Negative cosines clamp to 0. Embedding failures score 0 and are logged.
pub struct EmbeddingOracle<E: Embedder> {
    embedder: E,
}

impl<E: Embedder> EmbeddingOracle<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    fn try_score(&self, needs: &[String], offers: &[String]) -> Result<f32> {
        let n = self.embedder.embed(&needs.join(" "))?;
        let o = self.embedder.embed(&offers.join(" "))?;
        Ok(cosine(&n, &o).clamp(0.0, 1.0))
    }
}

impl<E: Embedder> CompatibilityOracle for EmbeddingOracle<E> {
    fn score(&self, needs: &[String], offers: &[String]) -> f32 {
        if needs.is_empty() || offers.is_empty() {
            return 0.0;
        }
        match self.try_score(needs, offers) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("embedding oracle failed, scoring 0: {e:#}");
                0.0
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbedReq<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResp {
    embedding: Vec<f64>,
}

/// Semantic embedder backed by Ollama's `/api/embeddings`, with a per-text cache.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    cache: Mutex<HashMap<String, Embedding>>,
    dim: usize,
}

impl OllamaEmbedder {
    /// Connects and embeds a sample once to learn the model dimension.
    pub fn connect(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        let mut embedder = Self {
            base_url: base_url.into(),
            model: model.into(),
            client,
            cache: Mutex::new(HashMap::new()),
            dim: 0,
        };
        embedder.dim = embedder.request("dimension check")?.len();
        Ok(embedder)
    }

    fn request(&self, text: &str) -> Result<Embedding> {
        let url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&OllamaEmbedReq {
                model: &self.model,
                prompt: text,
            })
            .send()
            .with_context(|| format!("Failed to reach Ollama at {}", self.base_url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            anyhow::bail!("Ollama embedding failed ({status}): {body}");
        }

        let parsed: OllamaEmbedResp = resp
            .json()
            .context("Failed to parse Ollama embedding response")?;
        let mut v: Embedding = parsed.embedding.iter().map(|&x| x as f32).collect();
        l2_normalize(&mut v);
        Ok(v)
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Embedder for OllamaEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        if let Some(hit) = self.cache.lock().get(text) {
            return Ok(hit.clone());
        }
        let v = self.request(text)?;
        self.cache.lock().insert(text.to_string(), v.clone());
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_hash_embedder_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64, 42);
        let e1 = embedder.embed("data analysis").unwrap();
        let e2 = embedder.embed("data analysis").unwrap();
        assert_eq!(e1, e2);
        let norm: f32 = e1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_oracle_identical_text_scores_one() {
        let oracle = EmbeddingOracle::new(HashEmbedder::new(128, 7));
        let score = oracle.score(&s(&["graphic design"]), &s(&["Graphic Design"]));
        assert!((score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_sides_score_zero() {
        let oracle = EmbeddingOracle::new(HashEmbedder::default());
        assert_eq!(oracle.score(&[], &s(&["x"])), 0.0);
        assert_eq!(KeywordOracle.score(&s(&["x"]), &[]), 0.0);
    }

    #[test]
    fn test_keyword_oracle_averages_best_matches() {
        let needs = s(&["web design", "tax advice"]);
        let offers = s(&["web design", "plumbing"]);
        let score = KeywordOracle.score(&needs, &offers);
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_closure_oracle_is_clamped() {
        let oracle = |_: &[String], _: &[String]| 1.7f32;
        assert_eq!(oracle.score(&[], &[]), 1.0);
    }
}
