// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded-concurrency wrapper with per-call timeouts.
//!
//! Servers put a `Pool` in front of request handlers: `wait_slot` gates
//! admission at `limit` concurrent calls, and each call races a timeout
//! task that throws [`Error::Timeout`] into the handler's task.

use std::cell::Cell;
use std::future::Future;
use std::time::Duration;

use crate::error::Error;
use crate::hub::Hub;
use crate::sync::Condition;

pub struct Pool {
    limit: usize,
    timeout: Duration,
    current: Cell<usize>,
    cond: Condition,
}

impl Pool {
    pub fn new(limit: usize, timeout: Duration) -> Self {
        Self {
            limit,
            timeout,
            current: Cell::new(0),
            cond: Condition::new(),
        }
    }

    /// Calls currently in flight.
    pub fn current(&self) -> usize {
        self.current.get()
    }

    /// Park until the pool has a free slot. FIFO among waiters.
    pub async fn wait_slot(&self) -> Result<(), Error> {
        while self.current.get() >= self.limit {
            self.cond.wait().await?;
        }
        Ok(())
    }

    /// Run `handler` under the pool's accounting. A timeout task is
    /// spawned alongside; if it fires first, the handler's next
    /// suspension point raises [`Error::Timeout`]. The slot is released
    /// and one waiter notified either way.
    pub async fn run<T, F>(&self, handler: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        let hub = Hub::current();
        self.current.set(self.current.get() + 1);

        let caller = hub.current_task();
        let timeout = self.timeout;
        let h = hub.clone();
        let killer = hub.spawn(async move {
            h.sleep(timeout).await?;
            caller.throw(Error::Timeout);
            Ok(())
        });

        let result = handler.await;

        // No suspension between the handler finishing and this cancel,
        // so a not-yet-fired killer can never hit a finished handler.
        killer.cancel();
        self.current.set(self.current.get() - 1);
        self.cond.notify();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    fn run_in_hub<F>(body: impl FnOnce(Hub) -> F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let hub = Hub::new().unwrap();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let fut = body(hub.clone());
        hub.add_task(async move {
            fut.await?;
            d.set(true);
            Ok(())
        });
        hub.run().unwrap();
        assert!(done.get(), "hub task did not complete cleanly");
    }

    #[test]
    fn bounded_concurrency_admits_in_waves() {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        run_in_hub(move |hub| async move {
            let pool = Rc::new(Pool::new(2, Duration::from_millis(500)));
            for i in 1..=4 {
                let pool = pool.clone();
                let log = l.clone();
                let h = hub.clone();
                hub.spawn(async move {
                    pool.wait_slot().await?;
                    pool.run(async {
                        log.borrow_mut().push(format!("{i}_start"));
                        h.sleep(Duration::from_millis(40)).await?;
                        log.borrow_mut().push(format!("{i}_end"));
                        Ok(())
                    })
                    .await
                });
            }
            Ok(())
        });
        assert_eq!(
            *log.borrow(),
            vec![
                "1_start", "2_start", "1_end", "2_end", "3_start", "4_start", "3_end", "4_end"
            ]
        );
    }

    #[test]
    fn slow_handler_is_timed_out() {
        let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let elapsed = Rc::new(Cell::new(Duration::ZERO));
        let e = elapsed.clone();
        run_in_hub(move |hub| async move {
            let pool = Pool::new(2, Duration::from_millis(50));
            let start = Instant::now();
            let h = hub.clone();
            let res = pool
                .run(async {
                    match h.sleep(Duration::from_millis(400)).await {
                        Err(Error::Timeout) => {
                            l.borrow_mut().push("timeout");
                            Err(Error::Timeout)
                        }
                        other => {
                            l.borrow_mut().push("finished");
                            other
                        }
                    }
                })
                .await;
            e.set(start.elapsed());
            assert!(matches!(res, Err(Error::Timeout)));
            assert_eq!(pool.current(), 0);
            Ok(())
        });
        assert_eq!(*log.borrow(), vec!["timeout"]);
        assert!(elapsed.get() < Duration::from_millis(300));
    }

    #[test]
    fn fast_handler_cancels_its_killer() {
        run_in_hub(|hub| async move {
            let pool = Pool::new(1, Duration::from_millis(500));
            let h = hub.clone();
            let res = pool
                .run(async move {
                    h.sleep(Duration::from_millis(5)).await?;
                    Ok(42)
                })
                .await?;
            assert_eq!(res, 42);
            // The killer is cancelled; the hub must not linger for the
            // full pool timeout waiting on it.
            Ok(())
        });
    }
}
