//! 幂等守卫
//!
//! `check_and_mark` 必须是对共享存储的单次原子操作：两个 worker 同时看到同一个
//! 新 `EventId` 时，只有一个拿到 `New`。
//!
//! 记录过期即视为不存在：
//! - `Succeeded` 保留 `retention`，覆盖完整的重投/重试窗口；
//! - `InProgress` 保留 `in_progress_ttl`，避免崩溃的 worker 永久占住某个 ID。
//!
//! 去重只是尽力而为：成功记录在所有重投到达前被淘汰时，仍可能多执行一次，
//! 处理器在业务层面也应保持幂等。

use crate::envelope::EventId;
use crate::error::EventingResult;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::time::Instant;

/// 去重检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStatus {
    /// 首次出现，已标记为处理中
    New,
    /// 另一 worker 正在处理
    InProgress,
    /// 已成功处理过
    Succeeded,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// 原子地检查并（在不存在时）标记为处理中
    async fn check_and_mark(&self, event_id: &EventId) -> EventingResult<DedupStatus>;

    async fn mark_succeeded(&self, event_id: &EventId) -> EventingResult<()>;

    /// 撤销处理中标记，使后续重投可以再次处理
    async fn release(&self, event_id: &EventId) -> EventingResult<()>;

    /// 清理过期记录，返回清理数量
    async fn purge_expired(&self) -> EventingResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    InProgress,
    Succeeded,
}

#[derive(Debug, Clone, Copy)]
struct DedupRecord {
    state: RecordState,
    expires_at: Instant,
}

impl DedupRecord {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// 基于 `DashMap` 的进程内实现；entry API 在检查与写入期间持有分片锁
pub struct InMemoryIdempotencyStore {
    records: DashMap<EventId, DedupRecord>,
    retention: Duration,
    in_progress_ttl: Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new(retention: Duration, in_progress_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention,
            in_progress_ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn in_progress(&self, now: Instant) -> DedupRecord {
        DedupRecord {
            state: RecordState::InProgress,
            expires_at: now + self.in_progress_ttl,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_mark(&self, event_id: &EventId) -> EventingResult<DedupStatus> {
        let now = Instant::now();
        let status = match self.records.entry(*event_id) {
            Entry::Vacant(slot) => {
                slot.insert(self.in_progress(now));
                DedupStatus::New
            }
            Entry::Occupied(mut slot) => {
                let record = *slot.get();
                if record.is_expired(now) {
                    slot.insert(self.in_progress(now));
                    DedupStatus::New
                } else {
                    match record.state {
                        RecordState::InProgress => DedupStatus::InProgress,
                        RecordState::Succeeded => DedupStatus::Succeeded,
                    }
                }
            }
        };
        Ok(status)
    }

    async fn mark_succeeded(&self, event_id: &EventId) -> EventingResult<()> {
        self.records.insert(
            *event_id,
            DedupRecord {
                state: RecordState::Succeeded,
                expires_at: Instant::now() + self.retention,
            },
        );
        Ok(())
    }

    async fn release(&self, event_id: &EventId) -> EventingResult<()> {
        self.records
            .remove_if(event_id, |_, record| record.state == RecordState::InProgress);
        Ok(())
    }

    async fn purge_expired(&self) -> EventingResult<usize> {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> InMemoryIdempotencyStore {
        InMemoryIdempotencyStore::new(Duration::from_secs(60), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn lifecycle_new_in_progress_succeeded() {
        let store = store();
        let id = EventId::new();

        assert_eq!(store.check_and_mark(&id).await.unwrap(), DedupStatus::New);
        assert_eq!(
            store.check_and_mark(&id).await.unwrap(),
            DedupStatus::InProgress
        );
        store.mark_succeeded(&id).await.unwrap();
        assert_eq!(
            store.check_and_mark(&id).await.unwrap(),
            DedupStatus::Succeeded
        );

        // 成功记录不会被 release 清掉
        store.release(&id).await.unwrap();
        assert_eq!(
            store.check_and_mark(&id).await.unwrap(),
            DedupStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn release_reopens_the_id() {
        let store = store();
        let id = EventId::new();
        store.check_and_mark(&id).await.unwrap();
        store.release(&id).await.unwrap();
        assert_eq!(store.check_and_mark(&id).await.unwrap(), DedupStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_records_count_as_absent_and_get_purged() {
        let store = store();
        let stale = EventId::new();
        let done = EventId::new();

        store.check_and_mark(&stale).await.unwrap();
        store.check_and_mark(&done).await.unwrap();
        store.mark_succeeded(&done).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(
            store.check_and_mark(&done).await.unwrap(),
            DedupStatus::Succeeded
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.check_and_mark(&done).await.unwrap(), DedupStatus::New);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_marks_yield_exactly_one_new() {
        for _ in 0..50 {
            let store = Arc::new(store());
            let id = EventId::new();

            let a = tokio::spawn({
                let store = store.clone();
                async move { store.check_and_mark(&id).await.unwrap() }
            });
            let b = tokio::spawn({
                let store = store.clone();
                async move { store.check_and_mark(&id).await.unwrap() }
            });

            let mut results = vec![a.await.unwrap(), b.await.unwrap()];
            results.sort_by_key(|s| *s != DedupStatus::New);
            assert_eq!(results, vec![DedupStatus::New, DedupStatus::InProgress]);
        }
    }
}
