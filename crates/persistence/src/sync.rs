use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

static LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_lock_poison_once(operation: &'static str) {
    if LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "persistence lock poisoned; recovered inner value");
    }
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, operation: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn_lock_poison_once(operation);
            poisoned.into_inner()
        }
    }
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, operation: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn_lock_poison_once(operation);
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write<'a, T>(
    lock: &'a RwLock<T>,
    operation: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn_lock_poison_once(operation);
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn poisoned_mutex_is_recovered() {
        let value = Mutex::new(7u32);
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = value.lock().expect("lock");
                    panic!("poison");
                })
                .join();
        });
        assert!(value.is_poisoned());
        assert_eq!(*lock(&value, "test"), 7);
    }

    #[test]
    fn poisoned_rwlock_is_recovered_for_read_and_write() {
        let value = RwLock::new(String::from("a"));
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = value.write().expect("write");
                    panic!("poison");
                })
                .join();
        });
        write(&value, "test").push('b');
        assert_eq!(read(&value, "test").as_str(), "ab");
    }
}
