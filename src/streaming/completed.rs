//! 已完成请求 ID 集合
//!
//! 流式会话结束后保留一段时间，用于屏蔽非流式路径随后到达的重复最终应答；过期后惰性清理。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct CompletedIdSet {
    grace: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl CompletedIdSet {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries, self.grace);
        entries.insert(id.to_string(), Instant::now());
    }

    pub fn contains(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries, self.grace);
        entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries, self.grace);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(entries: &mut HashMap<String, Instant>, grace: Duration) {
        entries.retain(|_, finished| finished.elapsed() < grace);
    }
}
