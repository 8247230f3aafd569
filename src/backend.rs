use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("queue backend error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("queue payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
}

/// The three list primitives the durable queue needs. All mutation happens
/// server-side in one operation; callers never read-modify-write.
/// Implementations can be Redis or in-memory (tests).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push_head(&self, list: &str, payload: String) -> Result<(), BackendError>;
    async fn pop_tail(&self, list: &str) -> Result<Option<String>, BackendError>;
    async fn len(&self, list: &str) -> Result<u64, BackendError>;
}

pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push_head(&self, list: &str, payload: String) -> Result<(), BackendError> {
        // ConnectionManager is a cheap cloneable handle over one multiplexed
        // connection; commands need &mut.
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(list, payload).await?;
        Ok(())
    }

    async fn pop_tail(&self, list: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.rpop(list, None).await?;
        Ok(value)
    }

    async fn len(&self, list: &str) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(list).await?;
        Ok(len)
    }
}

/// In-memory backend for tests; `set_available(false)` simulates an
/// unreachable store so breaker and retry paths can be exercised.
pub struct MemoryBackend {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory backend offline".to_string()))
        }
    }

    /// Test helper: the list contents, head first.
    pub fn snapshot(&self, list: &str) -> Vec<String> {
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        lists
            .get(list)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push_head(&self, list: &str, payload: String) -> Result<(), BackendError> {
        self.check_available()?;
        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        lists.entry(list.to_string()).or_default().push_front(payload);
        Ok(())
    }

    async fn pop_tail(&self, list: &str) -> Result<Option<String>, BackendError> {
        self.check_available()?;
        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        Ok(lists.get_mut(list).and_then(VecDeque::pop_back))
    }

    async fn len(&self, list: &str) -> Result<u64, BackendError> {
        self.check_available()?;
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        Ok(lists.get(list).map(|entries| entries.len() as u64).unwrap_or(0))
    }
}
