//! C8 — Embedding Queue: durable per-store FIFO of [`IndexJob`]s, drained by
//! N worker tasks that embed chunks (consulting C5, calling C6 on misses)
//! and upsert the results to C4 (spec.md §4.7).

use crate::cache::EmbeddingCache;
use crate::embed::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::types::{IndexJob, IndexJobChunk};
use crate::vector::{Payload, Point, VectorStore};
use rand::Rng;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

const BACKOFF_MS: [u64; 3] = [100, 400, 1600];
const MAX_RETRIES: usize = 3;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct JournalEntry {
    job_id: String,
    store: String,
    chunk_count: usize,
}

/// Append-only-in-the-normal-case journal with ack-driven compaction: each
/// `acknowledge` rewrites the file to hold only jobs still in flight, so a
/// crash never finds more than the currently undrained set on disk (spec.md
/// §6.2: "truncated as a prefix after worker acknowledgement").
struct Journal {
    path: PathBuf,
    file: std::fs::File,
    pending: Vec<JournalEntry>,
}

impl Journal {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        // No startup replay (DESIGN.md Open Question #3): a journal left
        // over from a prior process is orphaned, not recovered, so it's
        // dropped rather than appended to.
        let file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(Self { path, file, pending: Vec::new() })
    }

    fn append(&mut self, entry: JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(&entry).unwrap_or_default();
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        self.pending.push(entry);
        Ok(())
    }

    fn acknowledge(&mut self, job_id: &str) -> std::io::Result<()> {
        let before = self.pending.len();
        self.pending.retain(|e| e.job_id != job_id);
        if self.pending.len() == before {
            return Ok(());
        }
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            for entry in &self.pending {
                let line = serde_json::to_string(entry).unwrap_or_default();
                writeln!(tmp, "{line}")?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Result of draining one [`IndexJob`] (spec.md §4.7, "reported as
/// `partial` with per-batch error reasons").
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub job_id: String,
    pub embedded: usize,
    pub failed_batches: Vec<String>,
}

impl JobOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_batches.is_empty()
    }
}

struct QueuedJob {
    job: IndexJob,
    result_tx: Option<tokio::sync::oneshot::Sender<JobOutcome>>,
}

/// Per-store embedding queue: a durable JSON-lines journal plus N worker
/// tasks sharing one `mpsc` channel (work-stealing by virtue of all workers
/// polling the same receiver).
pub struct EmbeddingQueue {
    sender: mpsc::Sender<QueuedJob>,
    queued_chunks: Arc<AtomicUsize>,
    max_queued_chunks: usize,
    journal: Arc<Mutex<Journal>>,
}

impl EmbeddingQueue {
    pub fn spawn(
        queue_dir: PathBuf,
        workers: usize,
        max_queued_chunks: usize,
        cache: Arc<EmbeddingCache>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        embed_batch_size: usize,
    ) -> CoreResult<Self> {
        std::fs::create_dir_all(&queue_dir)?;
        let journal_path = queue_dir.join("embedding.log");
        let journal = Arc::new(Mutex::new(Journal::open(journal_path)?));

        // mpsc capacity doubles as the in-flight buffer; actual backpressure
        // is enforced against `max_queued_chunks`, not the channel capacity.
        let (sender, receiver) = mpsc::channel::<QueuedJob>(max_queued_chunks.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let queued_chunks = Arc::new(AtomicUsize::new(0));

        for _ in 0..workers.max(1) {
            let receiver = receiver.clone();
            let cache = cache.clone();
            let embedder = embedder.clone();
            let vector_store = vector_store.clone();
            let queued_chunks = queued_chunks.clone();
            let journal = journal.clone();
            tokio::spawn(async move {
                worker_loop(receiver, cache, embedder, vector_store, embed_batch_size, queued_chunks, journal).await;
            });
        }

        Ok(Self { sender, queued_chunks, max_queued_chunks, journal })
    }

    /// `Enqueue(store, chunks) -> {job_id, position}`.
    pub async fn enqueue(&self, job: IndexJob) -> CoreResult<(String, usize)> {
        let chunk_count = job.chunks.len();
        let current = self.queued_chunks.load(Ordering::SeqCst);
        if current + chunk_count > self.max_queued_chunks {
            return Err(CoreError::QueueFull(format!(
                "queue holds {current} chunks, max is {}",
                self.max_queued_chunks
            )));
        }
        self.append_journal_entry(&job)?;

        self.queued_chunks.fetch_add(chunk_count, Ordering::SeqCst);
        let job_id = job.job_id.clone();
        let position = current;
        self.sender
            .send(QueuedJob { job, result_tx: None })
            .await
            .map_err(|_| CoreError::Internal("embedding queue worker pool shut down".to_string()))?;
        Ok((job_id, position))
    }

    /// Enqueue and await the [`JobOutcome`] once fully drained, used by the
    /// indexing pipeline when a caller wants synchronous confirmation.
    pub async fn enqueue_and_wait(&self, job: IndexJob) -> CoreResult<JobOutcome> {
        let chunk_count = job.chunks.len();
        let current = self.queued_chunks.load(Ordering::SeqCst);
        if current + chunk_count > self.max_queued_chunks {
            return Err(CoreError::QueueFull(format!(
                "queue holds {current} chunks, max is {}",
                self.max_queued_chunks
            )));
        }
        self.append_journal_entry(&job)?;
        self.queued_chunks.fetch_add(chunk_count, Ordering::SeqCst);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(QueuedJob { job, result_tx: Some(tx) })
            .await
            .map_err(|_| CoreError::Internal("embedding queue worker pool shut down".to_string()))?;
        rx.await.map_err(|_| CoreError::Internal("embedding worker dropped before completing job".to_string()))
    }

    /// Durability record for a just-accepted job: recorded before the job
    /// is handed to a worker, removed from the journal once that worker
    /// acknowledges it drained (see [`Journal::acknowledge`]).
    fn append_journal_entry(&self, job: &IndexJob) -> CoreResult<()> {
        let entry = JournalEntry { job_id: job.job_id.clone(), store: job.store.clone(), chunk_count: job.chunks.len() };
        let mut journal = self.journal.lock().unwrap_or_else(|p| p.into_inner());
        journal.append(entry)?;
        Ok(())
    }
}

async fn worker_loop(
    receiver: Arc<AsyncMutex<mpsc::Receiver<QueuedJob>>>,
    cache: Arc<EmbeddingCache>,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    embed_batch_size: usize,
    queued_chunks: Arc<AtomicUsize>,
    journal: Arc<Mutex<Journal>>,
) {
    loop {
        let queued = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some(QueuedJob { job, result_tx }) = queued else { break };

        let chunk_count = job.chunks.len();
        let job_id = job.job_id.clone();
        let outcome = process_job(&job, &cache, embedder.as_ref(), vector_store.as_ref(), embed_batch_size).await;
        queued_chunks.fetch_sub(chunk_count, Ordering::SeqCst);

        {
            let mut journal = journal.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = journal.acknowledge(&job_id) {
                tracing::warn!(job_id = %job_id, error = %e, "failed to compact embedding journal after acknowledgement");
            }
        }

        if let Some(tx) = result_tx {
            let _ = tx.send(outcome);
        }
    }
}

async fn process_job(
    job: &IndexJob,
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
    vector_store: &dyn VectorStore,
    embed_batch_size: usize,
) -> JobOutcome {
    let mut outcome = JobOutcome { job_id: job.job_id.clone(), ..Default::default() };

    for batch in job.chunks.chunks(embed_batch_size.max(1)) {
        match process_batch(batch, cache, embedder, vector_store).await {
            Ok(n) => outcome.embedded += n,
            Err(e) => outcome.failed_batches.push(e.to_string()),
        }
    }
    outcome
}

async fn process_batch(
    batch: &[IndexJobChunk],
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
    vector_store: &dyn VectorStore,
) -> CoreResult<usize> {
    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(batch.len());
    let mut misses: Vec<(usize, String)> = Vec::new();

    for (i, chunk) in batch.iter().enumerate() {
        let (cached, hit) = cache.get(&chunk.text);
        if hit {
            vectors.push(cached);
        } else {
            vectors.push(None);
            misses.push((i, chunk.text.clone()));
        }
    }

    if !misses.is_empty() {
        let texts: Vec<String> = misses.iter().map(|(_, t)| t.clone()).collect();
        let embedded = with_retry(|| embedder.embed(&texts)).await?;
        for ((idx, text), vector) in misses.into_iter().zip(embedded.into_iter()) {
            cache.set(&text, vector.clone());
            vectors[idx] = Some(vector);
        }
    }

    let mut points = Vec::with_capacity(batch.len());
    for (chunk, vector) in batch.iter().zip(vectors.into_iter()) {
        let Some(vector) = vector else { continue };
        points.push(Point {
            id: chunk.doc_id.clone(),
            vector,
            payload: Payload {
                path: chunk.path.clone(),
                language: chunk.language.clone(),
                chunk_index: chunk.chunk_index,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
            },
        });
    }

    let count = points.len();
    with_retry(|| vector_store.upsert(points.clone())).await?;
    Ok(count)
}

/// Retry a retryable (`timeout`/`model_unavailable`) operation up to
/// [`MAX_RETRIES`] times with jittered backoff (spec.md §4.7:
/// 100ms/400ms/1.6s).
async fn with_retry<F, Fut, T>(mut f: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let base = BACKOFF_MS[attempt.min(BACKOFF_MS.len() - 1)];
                let jitter = rand::thread_rng().gen_range(0..=base / 4);
                tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    struct StubEmbedder {
        dim: usize,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0; self.dim]).collect())
        }
        fn dimension(&self) -> usize {
            self.dim
        }
    }

    fn job(store: &str, n: usize) -> IndexJob {
        IndexJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            store: store.to_string(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            chunks: (0..n)
                .map(|i| IndexJobChunk {
                    doc_id: format!("d{i}"),
                    path: "a.rs".into(),
                    language: "rust".into(),
                    chunk_index: i,
                    start_line: 1,
                    end_line: 1,
                    text: format!("text {i}"),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn enqueue_and_wait_embeds_and_upserts() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = Arc::new(StubEmbedder { dim: 4, calls: AtomicU32::new(0) });
        let vector_store = Arc::new(crate::vector::InMemoryVectorStore::new());

        let queue = EmbeddingQueue::spawn(
            dir.path().to_path_buf(),
            1,
            1000,
            cache,
            embedder,
            vector_store.clone(),
            8,
        )
        .unwrap();

        let outcome = queue.enqueue_and_wait(job("default", 3)).await.unwrap();
        assert_eq!(outcome.embedded, 3);
        assert!(!outcome.is_partial());
        assert!(vector_store.get_vector("d0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backpressure_rejects_when_over_capacity() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = Arc::new(StubEmbedder { dim: 4, calls: AtomicU32::new(0) });
        let vector_store = Arc::new(crate::vector::InMemoryVectorStore::new());

        let queue =
            EmbeddingQueue::spawn(dir.path().to_path_buf(), 1, 2, cache, embedder, vector_store, 8).unwrap();

        let result = queue.enqueue(job("default", 5)).await;
        assert!(matches!(result, Err(CoreError::QueueFull(_))));
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_embed_call() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = Arc::new(StubEmbedder { dim: 4, calls: AtomicU32::new(0) });
        let vector_store = Arc::new(crate::vector::InMemoryVectorStore::new());

        let queue = EmbeddingQueue::spawn(
            dir.path().to_path_buf(),
            1,
            1000,
            cache.clone(),
            embedder.clone(),
            vector_store,
            8,
        )
        .unwrap();

        queue.enqueue_and_wait(job("default", 1)).await.unwrap();
        queue.enqueue_and_wait(job("default", 1)).await.unwrap();

        // second job reuses the cached vector for identical chunk text
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn journal_is_compacted_after_acknowledgement() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(EmbeddingCache::new(100));
        let embedder = Arc::new(StubEmbedder { dim: 4, calls: AtomicU32::new(0) });
        let vector_store = Arc::new(crate::vector::InMemoryVectorStore::new());

        let queue = EmbeddingQueue::spawn(
            dir.path().to_path_buf(),
            1,
            1000,
            cache,
            embedder,
            vector_store,
            8,
        )
        .unwrap();

        queue.enqueue_and_wait(job("default", 2)).await.unwrap();

        let journal_path = dir.path().join("embedding.log");
        let contents = std::fs::read_to_string(&journal_path).unwrap();
        assert!(contents.trim().is_empty(), "journal should be empty once the only job has been acknowledged");
    }
}
