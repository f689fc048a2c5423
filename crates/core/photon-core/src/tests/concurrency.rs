//! Randomised interleavings of concurrent kernel callers under shuttle.

use shuttle::sync::Arc;
use shuttle::thread;

use super::{assert_settled, kernel, spawn};
use crate::{MutexMeta, QueueOrder, Timeout};

#[test]
fn concurrent_callers_keep_invariants() {
    shuttle::check_random(
        || {
            let k = Arc::new(kernel());
            let m = k.mutex_create(MutexMeta::new("shared")).unwrap();
            let q = k.wait_queue_create(QueueOrder::Fifo).unwrap();
            let a = spawn(&k, "a", 4);
            let b = spawn(&k, "b", 6);
            let c = spawn(&k, "c", 2);
            k.start().unwrap();

            let lockers: Vec<_> = [a, b]
                .into_iter()
                .map(|task| {
                    let k = Arc::clone(&k);
                    thread::spawn(move || {
                        for _ in 0..3 {
                            if k.mutex_lock(task, m, Timeout::Poll).is_ok() {
                                thread::yield_now();
                                k.mutex_unlock(task, m).unwrap();
                            }
                            thread::yield_now();
                        }
                    })
                })
                .collect();

            let waiter = {
                let k = Arc::clone(&k);
                thread::spawn(move || {
                    for _ in 0..3 {
                        let _ = k.wait_on(c, q, Timeout::Ticks(2));
                        thread::yield_now();
                    }
                })
            };

            let ticker = {
                let k = Arc::clone(&k);
                thread::spawn(move || {
                    for _ in 0..4 {
                        k.tick().unwrap();
                        thread::yield_now();
                        k.signal_one(q).unwrap();
                        thread::yield_now();
                    }
                })
            };

            for handle in lockers {
                handle.join().unwrap();
            }
            waiter.join().unwrap();
            ticker.join().unwrap();

            assert_settled(&k);
            assert_eq!(k.mutex_info(m).unwrap().holder, None);
            assert_eq!(k.task_info(a).unwrap().current_priority.as_u8(), 4);
        },
        200,
    );
}
