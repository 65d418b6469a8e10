use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 一路可监控的媒体流
///
/// 由 fetcher 产出，只按 `id` 比较
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRef {
    pub id: String,
    #[serde(default)]
    pub url: String,
}

impl StreamRef {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

impl PartialEq for StreamRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for StreamRef {}

/// 流集合 (id -> StreamRef)
///
/// 既表示期望集合 (拉取结果)，也表示实际集合 (正在运行的任务)
#[derive(Debug, Clone, Default)]
pub struct StreamSet {
    streams: HashMap<String, StreamRef>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入流，相同 id 时后者覆盖前者
    pub fn insert(&mut self, stream: StreamRef) {
        self.streams.insert(stream.id.clone(), stream);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&StreamRef> {
        self.streams.get(id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamRef> {
        self.streams.values()
    }

    /// 返回排好序的 id 列表 (日志与测试使用)
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

impl FromIterator<StreamRef> for StreamSet {
    fn from_iter<I: IntoIterator<Item = StreamRef>>(iter: I) -> Self {
        let mut set = StreamSet::new();
        for stream in iter {
            set.insert(stream);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_by_id_only() {
        assert_eq!(
            StreamRef::new("a", "rtmp://one"),
            StreamRef::new("a", "rtmp://two")
        );
        assert_ne!(StreamRef::new("a", "x"), StreamRef::new("b", "x"));
    }

    #[test]
    fn duplicate_ids_collapse() {
        let set: StreamSet = vec![
            StreamRef::new("a", "rtmp://1"),
            StreamRef::new("b", "rtmp://2"),
            StreamRef::new("a", "rtmp://3"),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains("a"));
        assert!(!set.contains("c"));
        assert_eq!(set.get("a").map(|s| s.url.as_str()), Some("rtmp://3"));
        assert_eq!(set.sorted_ids(), vec!["a", "b"]);
    }
}
