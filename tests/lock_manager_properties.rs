use keylock::config::LockingConfig;
use keylock::locking::{
    CancellationToken, LockManager, LockRequest, LockTimeoutValue, ManualClock, OwnerId,
    WaitStrategyKind, thread_owner_resolver,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const STRATEGIES: [WaitStrategyKind; 2] = [WaitStrategyKind::Condvar, WaitStrategyKind::EntryUnit];

fn manager(kind: WaitStrategyKind) -> LockManager {
    let config = LockingConfig {
        wait_strategy: kind,
        poll_interval_ms: 20,
        ..LockingConfig::default()
    };
    LockManager::new(&config)
}

fn manual_manager(kind: WaitStrategyKind) -> (LockManager, Arc<ManualClock>) {
    let config = LockingConfig {
        wait_strategy: kind,
        ..LockingConfig::default()
    };
    let clock = Arc::new(ManualClock::new());
    let manager = LockManager::with_collaborators(&config, clock.clone(), thread_owner_resolver());
    (manager, clock)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Lock(usize),
    Unlock(usize),
}

#[test]
fn mutual_exclusion_under_contention() {
    for kind in STRATEGIES {
        let manager = manager(kind);
        let log: Arc<Mutex<HashMap<String, Vec<Event>>>> = Arc::default();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let workers: Vec<_> = (0..threads)
            .map(|worker| {
                let manager = manager.clone();
                let log = Arc::clone(&log);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..40 {
                        let key = format!("doc-{}", (worker + round) % 3);
                        let handle = manager
                            .acquire(key.as_str(), Duration::from_secs(10), Duration::from_secs(10))
                            .unwrap();
                        log.lock()
                            .unwrap()
                            .entry(key.clone())
                            .or_default()
                            .push(Event::Lock(worker));
                        thread::yield_now();
                        log.lock()
                            .unwrap()
                            .entry(key)
                            .or_default()
                            .push(Event::Unlock(worker));
                        assert!(handle.release());
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let log = log.lock().unwrap();
        for (key, events) in log.iter() {
            for pair in events.chunks(2) {
                match pair {
                    [Event::Lock(a), Event::Unlock(b)] => assert_eq!(a, b, "{kind} {key}"),
                    other => panic!("{kind}: interleaved events on {key}: {other:?}"),
                }
            }
        }
        assert_eq!(manager.active_lock_count(), 0, "{kind}");
    }
}

#[test]
fn table_shrinks_to_zero_after_burst() {
    for kind in STRATEGIES {
        let manager = manager(kind);
        let acquired = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for worker in 0..16 {
                let manager = &manager;
                let acquired = Arc::clone(&acquired);
                scope.spawn(move || {
                    for round in 0..25 {
                        let key = format!("k{}", (worker * 7 + round) % 5);
                        let _handle = manager
                            .acquire(key, Duration::from_secs(10), Duration::from_secs(10))
                            .unwrap();
                        acquired.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(acquired.load(Ordering::Relaxed), 400);
        assert_eq!(manager.active_lock_count(), 0, "{kind}");
    }
}

#[test]
fn release_is_idempotent() {
    let manager = manager(WaitStrategyKind::Condvar);
    let handle = manager
        .acquire("id1", Duration::from_secs(5), Duration::ZERO)
        .unwrap();

    assert!(manager.release(&handle));
    assert!(!manager.release(&handle));

    let next = manager
        .acquire_with(LockRequest::new("id1").owner(OwnerId::token("other")))
        .unwrap();
    assert!(!manager.release(&handle));
    assert_eq!(manager.current_owner("id1"), Some(OwnerId::token("other")));
    drop(next);
    assert_eq!(manager.active_lock_count(), 0);
}

#[test]
fn expired_lease_is_reclaimed() {
    for kind in STRATEGIES {
        let (manager, clock) = manual_manager(kind);
        let a = manager
            .acquire_with(
                LockRequest::new("id1")
                    .lease(Duration::from_millis(500))
                    .owner(OwnerId::token("A")),
            )
            .unwrap();

        clock.advance(Duration::from_secs(1));
        let b = manager
            .acquire_with(
                LockRequest::new("id1")
                    .lease(Duration::from_secs(5))
                    .timeout(Duration::from_secs(1))
                    .owner(OwnerId::token("B")),
            )
            .unwrap();

        assert_eq!(manager.current_owner("id1"), Some(OwnerId::token("B")));
        assert!(!a.is_held());
        assert!(b.is_held());
        drop(a);
        assert_eq!(manager.current_owner("id1"), Some(OwnerId::token("B")));
        drop(b);
        assert_eq!(manager.active_lock_count(), 0);
    }
}

#[test]
fn blocked_waiter_reclaims_after_real_lease_lapses() {
    for kind in STRATEGIES {
        let manager = manager(kind);
        let _abandoned = manager
            .acquire_with(
                LockRequest::new("id1")
                    .lease(Duration::from_millis(100))
                    .owner(OwnerId::token("A")),
            )
            .unwrap();

        let start = Instant::now();
        let b = manager
            .acquire_with(
                LockRequest::new("id1")
                    .lease(Duration::from_secs(5))
                    .timeout(Duration::from_secs(5))
                    .owner(OwnerId::token("B")),
            )
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(90), "{kind}");
        assert!(start.elapsed() < Duration::from_secs(2), "{kind}");
        assert_eq!(b.owner(), &OwnerId::token("B"));
    }
}

#[test]
fn reentrant_acquire_does_not_block() {
    let manager = manager(WaitStrategyKind::Condvar);
    let outer = manager
        .acquire("id1", Duration::from_secs(5), Duration::ZERO)
        .unwrap();

    let start = Instant::now();
    let inner = manager
        .acquire("id1", Duration::from_secs(5), Duration::ZERO)
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));
    assert!(inner.is_reentrant());
    assert_eq!(manager.active_lock_count(), 1);

    drop(inner);
    assert!(outer.is_held());
    drop(outer);
    assert_eq!(manager.active_lock_count(), 0);
}

#[test]
fn timeout_is_honoured() {
    for kind in STRATEGIES {
        let manager = manager(kind);
        let _a = manager
            .acquire_with(
                LockRequest::new("id1")
                    .lease(Duration::from_secs(10))
                    .owner(OwnerId::token("A")),
            )
            .unwrap();

        let start = Instant::now();
        let err = manager
            .acquire_with(
                LockRequest::new("id1")
                    .lease(Duration::from_secs(10))
                    .timeout(Duration::from_millis(200))
                    .owner(OwnerId::token("B")),
            )
            .unwrap_err();
        let waited = start.elapsed();

        assert!(err.is_timeout(), "{kind}: {err}");
        assert!(waited >= Duration::from_millis(200), "{kind}: {waited:?}");
        assert!(waited < Duration::from_millis(1_000), "{kind}: {waited:?}");
    }
}

#[test]
fn try_acquire_scenario() {
    let manager = manager(WaitStrategyKind::Condvar);
    let a = manager
        .acquire_with(
            LockRequest::new("id1")
                .lease(Duration::from_secs(5))
                .owner(OwnerId::token("A")),
        )
        .unwrap();

    let b = LockRequest::new("id1").owner(OwnerId::token("B"));
    assert!(manager.try_acquire_with(b.clone()).unwrap().is_none());
    assert!(a.release());
    let handle = manager.try_acquire_with(b).unwrap().unwrap();
    assert_eq!(handle.owner(), &OwnerId::token("B"));
}

#[test]
fn cancellation_interrupts_infinite_wait() {
    for kind in STRATEGIES {
        let manager = manager(kind);
        let _a = manager
            .acquire_with(LockRequest::new("id1").owner(OwnerId::token("A")))
            .unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let manager = manager.clone();
            let token = token.clone();
            thread::spawn(move || {
                manager.acquire_with(
                    LockRequest::new("id1")
                        .timeout(LockTimeoutValue::Infinite)
                        .owner(OwnerId::token("B"))
                        .cancellation(token),
                )
            })
        };

        thread::sleep(Duration::from_millis(60));
        token.cancel();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_interrupted(), "{kind}: {err}");
    }
}

#[test]
fn purge_drops_abandoned_keys() {
    let (manager, clock) = manual_manager(WaitStrategyKind::Condvar);
    let handles: Vec<_> = (0..3)
        .map(|index| {
            manager
                .acquire(format!("k{index}"), Duration::from_secs(1), Duration::ZERO)
                .unwrap()
        })
        .collect();
    let keeper = manager
        .acquire("keeper", Duration::from_secs(60), Duration::ZERO)
        .unwrap();

    clock.advance(Duration::from_secs(2));
    let report = manager.purge_expired();

    assert_eq!(report.purged, 3);
    assert_eq!(manager.active_lock_count(), 1);
    assert!(handles.iter().all(|handle| !handle.is_held()));
    assert!(handles.iter().all(|handle| !handle.release()));
    assert!(keeper.release());
}
