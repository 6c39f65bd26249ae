#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use memoria::embedding::{EmbeddingError, EmbeddingIdentity, EmbeddingProvider};
use memoria::memory::store::MemoryStore;
use memoria::memory::sync::{SyncManager, SyncOptions};

pub const DIMS: usize = 256;

/// Deterministic bag-of-words embedding: every lowercase word adds 1.0 to
/// the bucket its FNV-1a hash falls in. Texts sharing most words end up with
/// high cosine similarity.
pub struct HashingProvider {
    name: String,
    dims: usize,
    pub calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl HashingProvider {
    pub fn new() -> Self {
        Self::named("hashing")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dims: DIMS,
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }
}

pub fn bag_of_words(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.to_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        v[(hash % dims as u64) as usize] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "bag-of-words"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| bag_of_words(t, self.dims)).collect())
    }
}

/// Always fails with a non-retryable HTTP error.
pub struct FailingProvider {
    name: String,
    status: u16,
    pub calls: AtomicUsize,
}

impl FailingProvider {
    pub fn new(name: &str, status: u16) -> Self {
        Self {
            name: name.to_string(),
            status,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "failing"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingError::Http {
            provider: self.name.clone(),
            status: self.status,
            message: "upstream unavailable".into(),
        })
    }
}

/// Rate-limits the first `failures` calls, then behaves like [`HashingProvider`].
pub struct FlakyProvider {
    failures: usize,
    inner: HashingProvider,
}

impl FlakyProvider {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            inner: HashingProvider::named("flaky"),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(EmbeddingError::Other {
                provider: "flaky".into(),
                message: "Rate limit reached, please retry".into(),
            });
        }
        Ok(texts.iter().map(|t| bag_of_words(t, DIMS)).collect())
    }
}

/// Claims `DIMS` dimensions but answers with one extra.
pub struct WrongDimensionProvider;

#[async_trait]
impl EmbeddingProvider for WrongDimensionProvider {
    fn name(&self) -> &str {
        "wrong-dims"
    }

    fn model(&self) -> &str {
        "wrong"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|_| vec![1.0; DIMS + 1]).collect())
    }
}

pub fn identity() -> EmbeddingIdentity {
    EmbeddingIdentity::new("hashing", "bag-of-words", DIMS)
}

/// Fresh in-memory store pinned to the hashing provider's identity.
pub fn test_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::open_in_memory(identity()).unwrap())
}

pub fn sync_manager(
    root: &Path,
    store: Arc<MemoryStore>,
    provider: Arc<dyn EmbeddingProvider>,
) -> SyncManager {
    SyncManager::new("test-scope", root, store, vec![provider], SyncOptions::default())
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Unit vector along `axis`.
pub fn axis(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[axis % DIMS] = 1.0;
    v
}

/// Unit vector mostly along `a` with a `mix` component along `b`.
pub fn blend(a: usize, b: usize, mix: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[a % DIMS] = 1.0 - mix;
    v[b % DIMS] += mix;
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}
