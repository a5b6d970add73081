//! Integration tests against a real Redis instance.
//!
//! # Requirements
//!
//! A Redis server must be reachable at `redis://127.0.0.1:6379` (override
//! with `REDIS_URL`). Start one with:
//! `docker run -d -p 6379:6379 redis:7-alpine`
//!
//! Run with: `cargo test -p voucherflow-redis -- --ignored`
//!
//! Tests namespace their keys with random identifiers, so they can run
//! against a shared instance without interfering with each other.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages
#![allow(clippy::unwrap_used)]

use chrono::{Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;
use voucherflow_core::{SeckillVoucher, UserId, VoucherId};
use voucherflow_redis::cache::CacheClient;
use voucherflow_redis::id::IdGenerator;
use voucherflow_redis::lock::RedisLock;
use voucherflow_redis::seckill::{Admission, SeckillAdmission, SeckillError};

async fn test_conn() -> ConnectionManager {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    voucherflow_redis::connect(&url)
        .await
        .expect("Redis must be running for integration tests")
}

fn unique(tag: &str) -> String {
    format!("{tag}-{}", Uuid::new_v4())
}

fn unique_id() -> u64 {
    // Low 63 bits of a v4 uuid: unique enough per test run, and valid as
    // a BIGINT if it ever reaches a relational assertion.
    (Uuid::new_v4().as_u128() as u64) & 0x7FFF_FFFF_FFFF_FFFF
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Listing {
    name: String,
    rating: u32,
}

// ---------------------------------------------------------------------------
// Distributed lock
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore] // Requires Redis running
async fn lock_is_mutually_exclusive() {
    let conn = test_conn().await;
    let name = unique("itest-lock");

    let holder = RedisLock::new(conn.clone(), &name, Duration::from_secs(30));
    let contender = RedisLock::new(conn.clone(), &name, Duration::from_secs(30));

    assert!(holder.try_lock().await.unwrap());
    assert!(!contender.try_lock().await.unwrap());

    assert!(holder.unlock().await.unwrap());
    assert!(contender.try_lock().await.unwrap());
    assert!(contender.unlock().await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn stale_holder_cannot_release_a_reacquired_lock() {
    let conn = test_conn().await;
    let name = unique("itest-lock");

    let stale = RedisLock::new(conn.clone(), &name, Duration::from_secs(1));
    assert!(stale.try_lock().await.unwrap());

    // Let the TTL reclaim the lock, then have another holder take it.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let fresh = RedisLock::new(conn.clone(), &name, Duration::from_secs(30));
    assert!(fresh.try_lock().await.unwrap());

    // The stale holder's release must be a no-op on the fresh lock.
    assert!(!stale.unlock().await.unwrap());

    let contender = RedisLock::new(conn.clone(), &name, Duration::from_secs(30));
    assert!(!contender.try_lock().await.unwrap());

    assert!(fresh.unlock().await.unwrap());
}

// ---------------------------------------------------------------------------
// ID generator
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore] // Requires Redis running
async fn concurrent_ids_are_distinct_and_time_ordered() {
    let conn = test_conn().await;
    let prefix = unique("itest-id");
    let ids = IdGenerator::new(conn);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ids = ids.clone();
        let prefix = prefix.clone();
        handles.push(tokio::spawn(async move {
            let mut batch = Vec::with_capacity(1000);
            for _ in 0..1000 {
                batch.push(ids.next_id(&prefix).await.unwrap());
            }
            batch
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let distinct: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(distinct.len(), 10_000, "every generated id must be unique");

    // Within a second bucket the counter orders ids; across buckets the
    // timestamp does. Grouping by bucket, counters never repeat.
    let mut by_bucket: std::collections::HashMap<u64, HashSet<u64>> =
        std::collections::HashMap::new();
    for id in &all {
        assert!(
            by_bucket.entry(id >> 32).or_default().insert(id & 0xFFFF_FFFF),
            "counter reused within one second bucket"
        );
    }
}

// ---------------------------------------------------------------------------
// Cache client
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore] // Requires Redis running
async fn absent_keys_hit_the_loader_at_most_once() {
    let conn = test_conn().await;
    let cache = CacheClient::builder(conn).build();
    let entity = unique("itest-absent");

    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let calls = Arc::clone(&calls);
        let result: Option<Listing> = cache
            .get_or_load(&entity, "404", Duration::from_secs(60), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "the null sentinel must absorb repeated lookups of an absent key"
    );
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn read_through_fills_and_serves_from_cache() {
    let conn = test_conn().await;
    let cache = CacheClient::builder(conn).build();
    let entity = unique("itest-fill");

    let listing = Listing {
        name: "Harbor Noodles".to_string(),
        rating: 47,
    };

    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let loaded = listing.clone();
        let result: Option<Listing> = cache
            .get_or_load(&entity, "7", Duration::from_secs(60), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(loaded))
            })
            .await
            .unwrap();
        assert_eq!(result.as_ref(), Some(&listing));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Write-invalidate: after a delete the next read reloads.
    cache.invalidate(&entity, "7").await.unwrap();
    let calls_after = Arc::clone(&calls);
    let reloaded: Option<Listing> = cache
        .get_or_load(&entity, "7", Duration::from_secs(60), move || async move {
            calls_after.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Listing {
                name: "Harbor Noodles".to_string(),
                rating: 48,
            }))
        })
        .await
        .unwrap();
    assert_eq!(reloaded.unwrap().rating, 48);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn mutex_strategy_rebuilds_once_under_contention() {
    let conn = test_conn().await;
    let cache = CacheClient::builder(conn).build();
    let entity = unique("itest-mutex");

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let cache = cache.clone();
        let entity = entity.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_with_mutex(&entity, "1", Duration::from_secs(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Widen the race window: a slow source of truth.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Some(Listing {
                        name: "Dockside Dumplings".to_string(),
                        rating: 45,
                    }))
                })
                .await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.unwrap().rating, 45);
    }

    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "exactly one caller may rebuild; the rest wait and hit the cache"
    );
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn logical_expiry_serves_stale_and_rebuilds_once() {
    let conn = test_conn().await;
    let cache = CacheClient::builder(conn).build();
    let entity = unique("itest-logical");

    let stale = Listing {
        name: "Old Town Bakery".to_string(),
        rating: 40,
    };

    // Seed an already-expired entry, the way the administrative step
    // would have long ago.
    cache
        .set_with_logical_expiry(&entity, "1", &stale, Duration::from_secs(0))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let cache = cache.clone();
        let entity = entity.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_with_logical_expire(&entity, "1", Duration::from_secs(60), move || {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Some(Listing {
                            name: "Old Town Bakery".to_string(),
                            rating: 41,
                        }))
                    }
                })
                .await
        }));
    }

    // Every concurrent reader is served immediately with the stale value.
    for handle in handles {
        let served: Option<Listing> = handle.await.unwrap().unwrap();
        assert_eq!(served.unwrap().rating, 40);
    }

    // Give the background rebuild time to finish.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "only the lock winner may schedule a rebuild"
    );

    // The refreshed entry is now served fresh, without loader calls.
    let after: Option<Listing> = cache
        .get_with_logical_expire(&entity, "1", Duration::from_secs(60), || async {
            Ok(Some(Listing {
                name: "unreachable".to_string(),
                rating: 0,
            }))
        })
        .await
        .unwrap();
    assert_eq!(after.unwrap().rating, 41);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.rebuild_pool().shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn unseeded_hot_key_is_a_plain_miss() {
    let conn = test_conn().await;
    let cache = CacheClient::builder(conn).build();
    let entity = unique("itest-unseeded");

    let result: Option<Listing> = cache
        .get_with_logical_expire(&entity, "9", Duration::from_secs(60), || async {
            Ok(Some(Listing {
                name: "unreachable".to_string(),
                rating: 0,
            }))
        })
        .await
        .unwrap();

    assert!(result.is_none(), "hot keys are pre-seeded; a miss is final");
}

// ---------------------------------------------------------------------------
// Seckill admission
// ---------------------------------------------------------------------------

fn open_voucher(voucher_id: VoucherId, stock: i32) -> SeckillVoucher {
    let now = Utc::now();
    SeckillVoucher {
        voucher_id,
        begin_time: now - ChronoDuration::minutes(1),
        end_time: now + ChronoDuration::hours(1),
        stock,
    }
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn admissions_never_exceed_stock() {
    let conn = test_conn().await;
    let voucher_id = VoucherId(unique_id());
    let admission =
        SeckillAdmission::new(conn.clone()).with_stream_key(unique("itest-stream"));

    admission
        .publish_voucher(&open_voucher(voucher_id, 5))
        .await
        .unwrap();

    let first_user = unique_id();
    let mut handles = Vec::new();
    for user in 0..50_u64 {
        let admission = admission.clone();
        handles.push(tokio::spawn(async move {
            admission.admit(voucher_id, UserId(first_user + user)).await
        }));
    }

    let mut admitted = 0;
    let mut sold_out = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Admission::Admitted { .. } => admitted += 1,
            Admission::SoldOut => sold_out += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(admitted, 5, "admissions must never exceed stock");
    assert_eq!(sold_out, 45);
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn second_admission_for_the_same_user_is_rejected() {
    let conn = test_conn().await;
    let voucher_id = VoucherId(unique_id());
    let user = UserId(unique_id());
    let admission = SeckillAdmission::new(conn).with_stream_key(unique("itest-stream"));

    admission
        .publish_voucher(&open_voucher(voucher_id, 10))
        .await
        .unwrap();

    assert!(matches!(
        admission.admit(voucher_id, user).await.unwrap(),
        Admission::Admitted { .. }
    ));
    assert_eq!(
        admission.admit(voucher_id, user).await.unwrap(),
        Admission::AlreadyOrdered
    );
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn sale_window_is_enforced_before_the_script() {
    let conn = test_conn().await;
    let admission = SeckillAdmission::new(conn).with_stream_key(unique("itest-stream"));
    let now = Utc::now();

    let early = VoucherId(unique_id());
    admission
        .publish_voucher(&SeckillVoucher {
            voucher_id: early,
            begin_time: now + ChronoDuration::hours(1),
            end_time: now + ChronoDuration::hours(2),
            stock: 10,
        })
        .await
        .unwrap();
    assert_eq!(
        admission.admit(early, UserId(1)).await.unwrap(),
        Admission::NotStarted
    );

    let late = VoucherId(unique_id());
    admission
        .publish_voucher(&SeckillVoucher {
            voucher_id: late,
            begin_time: now - ChronoDuration::hours(2),
            end_time: now - ChronoDuration::hours(1),
            stock: 10,
        })
        .await
        .unwrap();
    assert_eq!(
        admission.admit(late, UserId(1)).await.unwrap(),
        Admission::Ended
    );
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn admission_against_an_unpublished_voucher_fails() {
    let conn = test_conn().await;
    let admission = SeckillAdmission::new(conn).with_stream_key(unique("itest-stream"));

    let result = admission.admit(VoucherId(unique_id()), UserId(1)).await;
    assert!(matches!(
        result,
        Err(SeckillError::VoucherNotPublished(_))
    ));
}
