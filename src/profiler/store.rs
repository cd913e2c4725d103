//! 采样结果存储
//!
//! 结果序列化后经 zlib 压缩写入共享 KV 存储，压缩后仍超过单值上限的结果直接丢弃。

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::RwLock;

use super::model::RequestProfile;

/// 存储键前缀
const KEY_PREFIX: &str = "__mini_profiler_request_";

/// 默认单值上限（与 memcache 一致）
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1_000_000;

/// 默认过期时间: 1 小时
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// 类 memcache 的 KV 存储
///
/// 只假定单键读写的原子性
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// 写入（覆盖已有值）
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool;

    /// 仅在键不存在时写入
    fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool;

    fn delete(&self, key: &str) -> bool;

    fn max_value_size(&self) -> usize;

    fn default_ttl(&self) -> Option<Duration>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// 进程内 KV 存储
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    max_value_size: usize,
    default_ttl: Option<Duration>,
}

impl MemoryStore {
    pub fn new(max_value_size: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_value_size,
            default_ttl,
        }
    }

    /// 清理过期条目
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, entry| !entry.is_expired(now));
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VALUE_SIZE, Some(DEFAULT_TTL))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // 惰性删除过期条目
        self.entries.write().remove(key);
        None
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        if value.len() > self.max_value_size {
            return false;
        }
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().insert(key.to_string(), entry);
        true
    }

    fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        if value.len() > self.max_value_size {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| !entry.is_expired(now)) {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        true
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }
}

/// 存储错误
#[derive(Debug)]
pub enum StoreError {
    /// 压缩后仍超过单值上限
    TooLarge { size: usize, max: usize },
    /// 序列化或压缩失败
    Encode(String),
    /// 解压或反序列化失败
    Decode(String),
    /// 后端拒绝写入
    Rejected,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::TooLarge { size, max } => write!(
                f,
                "profile is {} bytes after compression, larger than the store limit of {} bytes",
                size, max
            ),
            StoreError::Encode(e) => write!(f, "failed to encode profile: {}", e),
            StoreError::Decode(e) => write!(f, "failed to decode profile: {}", e),
            StoreError::Rejected => write!(f, "store rejected the profile"),
        }
    }
}

impl std::error::Error for StoreError {}

/// 采样结果存储
#[derive(Clone)]
pub struct ResultStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(request_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, request_id)
    }

    /// 压缩并写入采样结果
    ///
    /// 同一 ID 重复写入时后写覆盖先写
    pub fn store(&self, profile: &RequestProfile) -> Result<(), StoreError> {
        let compressed = encode(profile)?;
        let max = self.kv.max_value_size();
        if compressed.len() > max {
            tracing::warn!(
                request_id = %profile.request_id,
                "采样结果压缩后为 {} 字节，超过存储上限 {} 字节，已丢弃",
                compressed.len(),
                max
            );
            return Err(StoreError::TooLarge {
                size: compressed.len(),
                max,
            });
        }

        let key = Self::key(&profile.request_id);
        if self.kv.set(&key, compressed, self.kv.default_ttl()) {
            Ok(())
        } else {
            Err(StoreError::Rejected)
        }
    }

    /// 读取采样结果，ID 为空、不存在或已过期时返回 None
    pub fn get(&self, request_id: &str) -> Option<RequestProfile> {
        if request_id.is_empty() {
            return None;
        }
        let compressed = self.kv.get(&Self::key(request_id))?;
        match decode(&compressed) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(request_id = %request_id, "读取采样结果失败: {}", e);
                None
            }
        }
    }

    /// 按顺序批量读取
    ///
    /// 跳过不存在或已禁用的结果；重定向结果返回一次后立即禁用
    pub fn get_many<S: AsRef<str>>(&self, request_ids: &[S]) -> Vec<RequestProfile> {
        let mut profiles = Vec::new();

        for request_id in request_ids {
            let Some(profile) = self.get(request_id.as_ref()) else {
                continue;
            };
            if profile.disabled {
                continue;
            }

            if profile.is_redirect_continuation {
                let mut disabled = profile.clone();
                disabled.disabled = true;
                if let Err(e) = self.store(&disabled) {
                    tracing::warn!(request_id = %disabled.request_id, "禁用重定向采样结果失败: {}", e);
                }
            }
            profiles.push(profile);
        }

        profiles
    }
}

fn encode(profile: &RequestProfile) -> Result<Vec<u8>, StoreError> {
    let serialized = serde_json::to_vec(profile).map_err(|e| StoreError::Encode(e.to_string()))?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&serialized)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    encoder.finish().map_err(|e| StoreError::Encode(e.to_string()))
}

fn decode(compressed: &[u8]) -> Result<RequestProfile, StoreError> {
    let mut serialized = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut serialized)
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    serde_json::from_slice(&serialized).map_err(|e| StoreError::Decode(e.to_string()))
}
