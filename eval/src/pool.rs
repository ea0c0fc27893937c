use crossbeam::deque::{Injector, Steal};
use scopeguard::{defer, defer_on_unwind};
use std::sync::mpsc::{sync_channel, Receiver};

/// A unit of work for the pool. Jobs are expected to contain their own
/// failure handling; a panicking job takes its worker thread down.
pub(crate) trait PoolJob: Send {
    type Done: Send;
    fn run(&self) -> Self::Done;
}

enum QueueEntry<T> {
    Stop,
    Job(T),
}

/// Fixed-size worker pool with a completion channel.
///
/// Workers steal jobs from a shared injector queue and push completions to
/// the channel handed to the scheduler callback. The callback runs on the
/// submitting thread and must drain completions for every job it submits
/// before returning, or late sends back up against the channel bound.
pub(crate) struct WorkerPool<T: PoolJob> {
    capacity: usize,
    queue: Injector<QueueEntry<T>>,
}

impl<T> WorkerPool<T>
where
    T: PoolJob,
{
    pub fn new(capacity: usize) -> Self {
        WorkerPool {
            capacity,
            queue: Injector::new(),
        }
    }

    pub fn run<F, R>(&self, scheduler: F) -> R
    where
        F: FnOnce(&Receiver<T::Done>) -> R,
        R: Send,
    {
        let (tx, rx) = sync_channel(self.capacity);

        crossbeam::scope(|s| {
            for i in 0..self.capacity {
                // Handles are collected by the scope.
                let tx = tx.clone();
                s.builder()
                    .name(format!("worker-{}", i + 1))
                    .spawn(move |_| {
                        defer_on_unwind!(for _ in 0..self.capacity {
                            self.queue.push(QueueEntry::Stop);
                        });

                        loop {
                            match self.queue.steal() {
                                Steal::Success(QueueEntry::Stop) => break,
                                Steal::Success(QueueEntry::Job(job)) => {
                                    let done = job.run();
                                    // A closed channel means the scheduler is
                                    // gone; stop quietly.
                                    if tx.send(done).is_err() {
                                        break;
                                    }
                                }
                                Steal::Empty | Steal::Retry => std::thread::yield_now(),
                            }
                        }
                    })
                    .expect("worker thread spawn");
            }

            {
                // Regardless of what happens in the scheduler, when it is
                // done, shut down the pool.
                defer!(for _ in 0..self.capacity {
                    self.queue.push(QueueEntry::Stop);
                });
                scheduler(&rx)
            }
        })
        .expect("no crossbeam errors")
    }

    pub fn submit(&self, job: T) {
        self.queue.push(QueueEntry::Job(job));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Doubler(i32);

    impl PoolJob for Doubler {
        type Done = i32;

        fn run(&self) -> i32 {
            self.0 * 2
        }
    }

    #[test]
    fn runs_submitted_jobs_to_completion() {
        let pool: WorkerPool<Doubler> = WorkerPool::new(3);
        let mut results = pool.run(|rx| {
            for i in 0..10 {
                pool.submit(Doubler(i));
            }
            (0..10).map(|_| rx.recv().unwrap()).collect::<Vec<i32>>()
        });
        results.sort();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<i32>>());
    }
}
