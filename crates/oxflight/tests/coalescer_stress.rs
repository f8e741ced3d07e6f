//! Stress tests for the blocking coalescer.
//!
//! These tests exercise the coalescer under high concurrency to verify
//! single execution, key independence and recovery from panicking work.

use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use oxflight::{Coalescer, CoalescerConfig, Panicked, Role, WaitError};

/// Number of threads for concurrent tests.
const THREAD_COUNT: usize = 8;

/// Number of waves for repeated-flight tests.
const WAVES: usize = 50;

fn wait_for_joiners<K: std::hash::Hash + Eq, V, E>(sf: &Coalescer<K, V, E>, n: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while sf.stats().joiners.load(Ordering::Relaxed) < n {
        assert!(Instant::now() < deadline, "joiners never arrived");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Single execution
// ============================================================================

#[test]
fn stress_same_key_single_execution() {
    let sf: Arc<Coalescer<&str, u64, ()>> = Arc::new(Coalescer::new());
    let executions = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let sf = Arc::clone(&sf);
            let executions = Arc::clone(&executions);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                sf.execute_shared("hot", || {
                    let n = executions.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Ok(n)
                })
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|e| e.role == Role::Owner).count(), 1);
    for execution in &results {
        assert_eq!(execution.result, Ok(0));
        assert!(execution.shared);
    }
    assert_eq!(sf.in_flight_count(), 0);

    let stats = sf.stats().snapshot();
    assert_eq!(stats.owners, 1);
    assert_eq!(stats.joiners, (THREAD_COUNT - 1) as u64);
    assert_eq!(stats.completed, 1);
}

#[test]
fn stress_waves_never_run_concurrently() {
    // Within any key, executions must never overlap.
    let sf: Arc<Coalescer<u32, (), ()>> = Arc::new(Coalescer::new());
    let running = Arc::new(AtomicU64::new(0));
    let executions = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let sf = Arc::clone(&sf);
            let running = Arc::clone(&running);
            let executions = Arc::clone(&executions);
            thread::spawn(move || {
                for _ in 0..WAVES {
                    sf.execute(7, || {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0, "overlapping flights");
                        executions.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(Duration::from_micros(200));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = sf.stats().snapshot();
    assert_eq!(stats.requests(), (THREAD_COUNT * WAVES) as u64);
    assert_eq!(stats.owners, executions.load(Ordering::Relaxed));
    assert_eq!(stats.completed, stats.owners);
    assert_eq!(sf.in_flight_count(), 0);
}

// ============================================================================
// Key independence
// ============================================================================

#[test]
fn stress_distinct_keys_run_concurrently() {
    let sf: Arc<Coalescer<usize, usize, ()>> =
        Arc::new(Coalescer::with_config(CoalescerConfig::default().with_shard_amount(16)));
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));

    let started = Instant::now();
    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|i| {
            let sf = Arc::clone(&sf);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                sf.execute(i, || {
                    thread::sleep(Duration::from_millis(100));
                    Ok(i)
                })
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Ok(i));
    }

    // Serialized execution would take THREAD_COUNT * 100ms.
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(sf.stats().snapshot().owners, THREAD_COUNT as u64);
    assert_eq!(sf.stats().snapshot().joiners, 0);
}

// ============================================================================
// Panics
// ============================================================================

#[test]
fn stress_panic_unblocks_all_joiners() {
    let sf: Arc<Coalescer<&str, (), ()>> = Arc::new(Coalescer::new());
    let joiner_count = THREAD_COUNT - 1;

    let owner = {
        let sf = Arc::clone(&sf);
        thread::spawn(move || {
            sf.execute("K", || {
                wait_for_joiners(&sf, joiner_count as u64);
                panic!("work exploded");
            })
        })
    };

    while !sf.is_in_flight(&"K") {
        thread::sleep(Duration::from_millis(1));
    }

    let joiners: Vec<_> = (0..joiner_count)
        .map(|_| {
            let sf = Arc::clone(&sf);
            thread::spawn(move || sf.execute("K", || Ok(())))
        })
        .collect();

    let owner_payload = owner.join().unwrap_err();
    assert_eq!(owner_payload.downcast_ref::<&str>(), Some(&"work exploded"));

    for joiner in joiners {
        let payload = joiner.join().unwrap_err();
        let panicked = payload.downcast_ref::<Panicked>().expect("Panicked payload");
        assert_eq!(panicked.message, "work exploded");
        assert_eq!(panicked.coalescer, "oxflight");
    }

    assert_eq!(sf.in_flight_count(), 0);
    let stats = sf.stats().snapshot();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.completed, 1);

    // The key must not be poisoned.
    assert_eq!(sf.execute("K", || Ok(())), Ok(()));
}

#[test]
fn stress_panicking_joiner_observed_via_catch_unwind() {
    let sf: Arc<Coalescer<&str, u8, ()>> = Arc::new(Coalescer::new());

    let owner = {
        let sf = Arc::clone(&sf);
        thread::spawn(move || {
            panic::catch_unwind(panic::AssertUnwindSafe(|| {
                sf.execute("K", || {
                    wait_for_joiners(&sf, 1);
                    panic!("{}", String::from("formatted"));
                })
            }))
        })
    };

    while !sf.is_in_flight(&"K") {
        thread::sleep(Duration::from_millis(1));
    }

    let joined = panic::catch_unwind(panic::AssertUnwindSafe(|| sf.execute("K", || Ok(1))));
    let payload = joined.unwrap_err();
    assert_eq!(payload.downcast_ref::<Panicked>().map(|p| p.message.as_str()), Some("formatted"));

    let owner_payload = owner.join().unwrap().unwrap_err();
    assert_eq!(owner_payload.downcast_ref::<String>().map(String::as_str), Some("formatted"));
}

// ============================================================================
// Timeouts
// ============================================================================

#[test]
fn stress_timed_out_joiner_does_not_disturb_flight() {
    let sf: Arc<Coalescer<&str, &str, ()>> = Arc::new(Coalescer::new());

    let owner = {
        let sf = Arc::clone(&sf);
        thread::spawn(move || {
            sf.execute_shared("K", || {
                // Finish only after one joiner gave up and another is waiting.
                while sf.stats().timeouts.load(Ordering::Relaxed) < 1 {
                    thread::sleep(Duration::from_millis(1));
                }
                wait_for_joiners(&sf, 2);
                Ok("done")
            })
        })
    };

    while !sf.is_in_flight(&"K") {
        thread::sleep(Duration::from_millis(1));
    }

    let impatient = sf.execute_timeout("K", Duration::from_millis(10), || Ok("never"));
    assert_eq!(impatient.unwrap_err(), WaitError::Timeout { waited: Duration::from_millis(10) });

    let patient = sf
        .execute_timeout("K", Duration::from_secs(10), || Ok("never"))
        .unwrap();
    assert_eq!(patient.role, Role::Joiner);
    assert_eq!(patient.result, Ok("done"));

    let owned = owner.join().unwrap();
    assert_eq!(owned.result, Ok("done"));
    assert!(owned.shared);
    assert_eq!(sf.in_flight_count(), 0);
}

// ============================================================================
// Leakage
// ============================================================================

#[test]
fn stress_no_registry_leak_across_many_keys() {
    let sf: Arc<Coalescer<(usize, usize), usize, String>> = Arc::new(Coalescer::new());

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|t| {
            let sf = Arc::clone(&sf);
            thread::spawn(move || {
                for i in 0..500 {
                    let key = (t % 2, i % 17);
                    let result = sf.execute(key, || {
                        if i % 5 == 0 {
                            Err(format!("failure {i}"))
                        } else {
                            Ok(i)
                        }
                    });
                    // Joiners may observe a different iteration's value, but
                    // never a mix of value and error from one flight.
                    match result {
                        Ok(v) => assert_ne!(v % 5, 0),
                        Err(msg) => assert!(msg.starts_with("failure ")),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(sf.in_flight_count(), 0);
    let stats = sf.stats().snapshot();
    assert_eq!(stats.requests(), (THREAD_COUNT * 500) as u64);
    assert_eq!(stats.completed, stats.owners);
}
