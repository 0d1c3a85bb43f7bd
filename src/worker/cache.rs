//! 每个会话最近一次请求的缓存（供 `!retry` 使用）
//!
//! 每次新请求覆盖旧值；重试只读取，不清除。仅内存保存。

use std::collections::HashMap;
use std::sync::Mutex;

use crate::bus::Message;

/// 缓存的请求：已合并附件的请求消息 + 最初的请求 ID
#[derive(Debug, Clone)]
pub struct StoredRequest {
    pub message: Message,
    pub origin_id: String,
}

#[derive(Debug, Default)]
pub struct RequestCache {
    entries: Mutex<HashMap<String, StoredRequest>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, conversation: &str, request: StoredRequest) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation.to_string(), request);
    }

    pub fn get(&self, conversation: &str) -> Option<StoredRequest> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins_and_get_does_not_consume() {
        let cache = RequestCache::new();
        let first = Message::content("chat", "worker", "c", "one", vec![]);
        let second = Message::content("chat", "worker", "c", "two", vec![]);
        cache.store(
            "c",
            StoredRequest {
                origin_id: first.id.clone(),
                message: first,
            },
        );
        cache.store(
            "c",
            StoredRequest {
                origin_id: second.id.clone(),
                message: second.clone(),
            },
        );

        assert_eq!(cache.get("c").unwrap().origin_id, second.id);
        assert!(cache.get("c").is_some());
        assert!(cache.get("other").is_none());
        assert_eq!(cache.len(), 1);
    }
}
