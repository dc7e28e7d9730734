//! Process-wide single-flight coordination for mount-state operations.
//!
//! Concurrent mount, unmount, or image-materialization calls for the same
//! `(pool, name)` pair must collapse into one underlying ZFS operation.
//! The first caller inserts a gate into a shared table and performs the
//! work; everyone else who finds the gate waits for it to open and assumes
//! the operation succeeded.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};

use super::Error;

/// The kinds of operation that are serialized per dataset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    Mount,
    Unmount,
    ImageCreate,
}

impl OpKind {
    fn as_str(self) -> &'static str {
        match self {
            OpKind::Mount => "mount",
            OpKind::Unmount => "umount",
            OpKind::ImageCreate => "image-create",
        }
    }
}

/// The table key for an in-flight operation.
pub fn operation_key(pool: &str, name: &str, kind: OpKind) -> String {
    format!("{}:{}:{}", kind.as_str(), pool, name)
}

/// A once-openable gate. Waiters block until the flight holder opens it.
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = self
                .cond
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

fn table() -> &'static Mutex<HashMap<String, Arc<Gate>>> {
    static TABLE: OnceLock<Mutex<HashMap<String, Arc<Gate>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Run `op` unless another caller is already in flight for `key`.
///
/// Returns `(held, result)`: `held` is true for the caller that performed
/// the operation. Waiters get `(false, Ok(()))` and must assume the flight
/// holder succeeded; in particular a waiter never owns a matching inverse
/// operation.
pub fn single_flight<F>(key: String, op: F) -> (bool, Result<(), Error>)
where
    F: FnOnce() -> Result<(), Error>,
{
    let existing = {
        let mut table = table().lock().unwrap_or_else(PoisonError::into_inner);
        match table.get(&key) {
            Some(gate) => Some(gate.clone()),
            None => {
                table.insert(key.clone(), Arc::new(Gate::new()));
                None
            }
        }
    };

    if let Some(gate) = existing {
        gate.wait();
        return (false, Ok(()));
    }

    let result = op();

    let mut table = table().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(gate) = table.remove(&key) {
        gate.release();
    }

    (true, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_flight_runs_once() {
        let executed = Arc::new(AtomicUsize::new(0));
        let holders = Arc::new(AtomicUsize::new(0));

        // Install the flight first, then pile waiters onto it while the op
        // is still sleeping.
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let holder = {
            let executed = executed.clone();
            let holders = holders.clone();
            thread::spawn(move || {
                let (held, result) = single_flight("mount:p:once".to_string(), move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(200));
                    Ok(())
                });
                assert!(held);
                assert!(result.is_ok());
                holders.fetch_add(1, Ordering::SeqCst);
            })
        };
        started_rx.recv().unwrap();

        let mut handles = vec![];
        for _ in 0..7 {
            let executed = executed.clone();
            let holders = holders.clone();
            handles.push(thread::spawn(move || {
                let (held, result) = single_flight("mount:p:once".to_string(), move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                assert!(result.is_ok());
                if held {
                    holders.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        holder.join().unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(holders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiters_do_not_observe_holder_error() {
        let barrier = Arc::new(Barrier::new(2));

        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                // Give the holder time to install the gate.
                thread::sleep(Duration::from_millis(20));
                single_flight("mount:p:err".to_string(), || Ok(()))
            })
        };

        let (held, result) = single_flight("mount:p:err".to_string(), || {
            barrier.wait();
            thread::sleep(Duration::from_millis(60));
            Err(Error::zfs("boom"))
        });
        assert!(held);
        assert!(result.is_err());

        let (waiter_held, waiter_result) = waiter.join().unwrap();
        // The waiter either joined the failed flight (and is told nothing)
        // or arrived late and ran its own successful flight.
        assert!(waiter_result.is_ok());
        let _ = waiter_held;
    }

    #[test]
    fn test_distinct_keys_do_not_serialize() {
        let (held_a, result_a) = single_flight(
            operation_key("p", "a", OpKind::Mount),
            || Ok(()),
        );
        let (held_b, result_b) = single_flight(
            operation_key("p", "a", OpKind::Unmount),
            || Ok(()),
        );
        assert!(held_a && held_b);
        assert!(result_a.is_ok() && result_b.is_ok());
    }

    #[test]
    fn test_operation_key_shape() {
        assert_eq!(operation_key("p", "c1", OpKind::Mount), "mount:p:c1");
        assert_eq!(operation_key("p", "c1", OpKind::Unmount), "umount:p:c1");
        assert_eq!(
            operation_key("p", "abc", OpKind::ImageCreate),
            "image-create:p:abc"
        );
    }
}
