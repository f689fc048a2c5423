//! Randomised operation sequences with invariant checks after every step.

use super::{assert_settled, kernel};
use crate::id::{MutexId, TaskId};
use crate::port::host::HostPort;
use crate::{Kernel, MutexMeta, MutexProtocol, Priority, QueueOrder, TaskMeta, Timeout};

/// Xorshift64 generator; deterministic per seed.
struct Rng(u64);

impl Rng {
    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    fn timeout(&mut self) -> Timeout {
        match self.below(4) {
            0 => Timeout::Poll,
            1 => Timeout::Forever,
            _ => Timeout::Ticks(1 + self.below(6) as u32),
        }
    }
}

const TASKS: usize = 8;

struct World {
    kernel: Kernel<HostPort>,
    tasks: Vec<TaskId>,
    mutexes: Vec<MutexId>,
}

impl World {
    fn new(rng: &mut Rng) -> Self {
        let kernel = kernel();
        let tasks = (0..TASKS)
            .map(|_| {
                let priority = Priority::new(2 + rng.below(12) as u8);
                kernel
                    .create_task(TaskMeta::new("rand").with_priority(priority))
                    .unwrap()
            })
            .collect();
        let mutexes = vec![
            kernel.mutex_create(MutexMeta::new("m0")).unwrap(),
            kernel
                .mutex_create(MutexMeta::new("m1").with_order(QueueOrder::Fifo))
                .unwrap(),
            kernel
                .mutex_create(
                    MutexMeta::new("m2").with_protocol(MutexProtocol::Ceiling(Priority::new(1))),
                )
                .unwrap(),
        ];
        Self {
            kernel,
            tasks,
            mutexes,
        }
    }

    /// Applies one random operation. Errors are legitimate outcomes here;
    /// only the bookkeeping afterwards is checked.
    fn step(&mut self, rng: &mut Rng, queue: crate::WaitQueueId, sem: crate::SemaphoreId) {
        let k = &self.kernel;
        let t = self.tasks[rng.below(self.tasks.len())];
        let m = self.mutexes[rng.below(self.mutexes.len())];
        let _ = match rng.below(20) {
            0 => k.activate(t),
            1 => k.suspend(t),
            2 => k.resume(t),
            3 => k.terminate(t),
            4 => k.set_priority(t, Priority::new(rng.below(16) as u8)),
            5 | 6 => k.mutex_lock(t, m, rng.timeout()).map(|_| ()),
            7 | 8 => k.mutex_unlock(t, m),
            9 => k.wait_on(t, queue, rng.timeout()).map(|_| ()),
            10 => k.signal_one(queue).map(|_| ()),
            11 => k.semaphore_take(t, sem, rng.timeout()).map(|_| ()),
            12 => k.semaphore_give(sem).map(|_| ()),
            13 => k.sleep(t, rng.below(4) as u32).map(|_| ()),
            14 => k.release_wait(t),
            15 => k.yield_now(t),
            16 => k.wait_outcome(t).map(|_| ()),
            17 => {
                // Replace a mutex, releasing its waiters.
                let index = rng.below(self.mutexes.len());
                let result = k.mutex_delete(self.mutexes[index]).map(|_| ());
                self.mutexes[index] = k.mutex_create(MutexMeta::new("again")).unwrap();
                result
            }
            _ => k.tick().map(|_| ()),
        };
    }
}

fn run(seed: u64, steps: usize) {
    let mut rng = Rng(seed);
    let mut world = World::new(&mut rng);
    let queue = world.kernel.wait_queue_create(QueueOrder::Priority).unwrap();
    let sem = world.kernel.semaphore_create(1, 3).unwrap();
    for &t in &world.tasks {
        world.kernel.activate(t).unwrap();
    }
    world.kernel.start().unwrap();
    assert_settled(&world.kernel);

    for _ in 0..steps {
        world.step(&mut rng, queue, sem);
        assert_settled(&world.kernel);
    }
}

#[test]
fn random_sequences_keep_invariants() {
    for seed in [0x9E37_79B9_7F4A_7C15, 1, 42, 0xDEAD_BEEF, 7_777_777] {
        run(seed, 2000);
    }
}

#[test]
fn termination_storm_leaves_everything_dormant() {
    let mut rng = Rng(0x1234_5678);
    let mut world = World::new(&mut rng);
    let queue = world.kernel.wait_queue_create(QueueOrder::Fifo).unwrap();
    let sem = world.kernel.semaphore_create(0, 1).unwrap();
    for &t in &world.tasks {
        world.kernel.activate(t).unwrap();
    }
    world.kernel.start().unwrap();
    for _ in 0..500 {
        world.step(&mut rng, queue, sem);
    }

    for &t in &world.tasks {
        let _ = world.kernel.terminate(t);
        assert_settled(&world.kernel);
    }
    for &t in &world.tasks {
        let info = world.kernel.task_info(t).unwrap();
        assert!(info.state.is_dormant());
        assert!(info.owned_mutexes.is_empty());
        assert_eq!(info.current_priority, info.base_priority);
    }
    for &m in &world.mutexes {
        let info = world.kernel.mutex_info(m).unwrap();
        assert_eq!(info.holder, None);
        assert!(info.waiters.is_empty());
    }
    assert_eq!(world.kernel.running(), None);
}
