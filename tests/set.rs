use crossbeam_utils::thread;
use intrusive_skiplist::SkipSet;
use rand::prelude::*;

#[test]
fn smoke() {
    let s = SkipSet::new();
    s.insert(1);
    s.insert(5);
    s.insert(7);

    assert!(s.contains(&5));
    assert!(!s.contains(&3));
    assert_eq!(s.len(), 3);
}

#[test]
fn concurrent_churn() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 5_000;

    let set = SkipSet::new();
    let set = &set;

    thread::scope(|scope| {
        for t in 0..THREADS {
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                let mut keys: Vec<u64> =
                    (t * PER_THREAD..(t + 1) * PER_THREAD).collect();
                keys.shuffle(&mut rng);

                for &k in &keys {
                    assert!(set.insert(k));
                }
                for &k in keys.iter().filter(|k| *k % 2 == 0) {
                    assert!(set.remove(&k));
                }
            });
        }
    })
    .unwrap();

    let seen: Vec<u64> = set.iter().collect();
    let expected: Vec<u64> = (0..THREADS * PER_THREAD).filter(|k| k % 2 == 1).collect();
    assert_eq!(seen, expected);
    assert_eq!(set.len(), expected.len());
}

#[test]
fn readers_race_removals() {
    const KEYS: u64 = 10_000;

    let set = SkipSet::new();
    for k in 0..KEYS {
        set.insert(k);
    }
    let set = &set;

    thread::scope(|scope| {
        scope.spawn(move |_| {
            for k in 0..KEYS {
                set.remove(&k);
            }
        });

        for _ in 0..2 {
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                for _ in 0..20_000 {
                    let k = rng.gen_range(0..KEYS);
                    // Whatever the lookup says must be self-consistent.
                    if let Some(v) = set.get(&k) {
                        assert_eq!(v, k);
                    }
                }
            });
        }
    })
    .unwrap();

    assert!(set.is_empty());
}
