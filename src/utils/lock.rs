//! Scoped access to the coordinator's shared tables
//!
//! The fault queue, its handler slot, and the controller table are read and
//! written from several tasks. Every access goes through these helpers so a
//! guard lives only for the closure and never across an await.

use tokio::sync::{Mutex, RwLock};

/// Run `f` on the value behind `mutex`
pub async fn with_lock<T, F, R>(mutex: &Mutex<T>, f: F) -> R
where
    F: FnOnce(&mut T) -> R,
{
    f(&mut *mutex.lock().await)
}

/// Run `f` on a shared view of the value behind `rwlock`
pub async fn with_read_lock<T, F, R>(rwlock: &RwLock<T>, f: F) -> R
where
    F: FnOnce(&T) -> R,
{
    f(&*rwlock.read().await)
}

/// Run `f` on an exclusive view of the value behind `rwlock`
pub async fn with_write_lock<T, F, R>(rwlock: &RwLock<T>, f: F) -> R
where
    F: FnOnce(&mut T) -> R,
{
    f(&mut *rwlock.write().await)
}

/// Move the contents out of `mutex`, leaving the default behind
pub async fn take_locked<T: Default>(mutex: &Mutex<T>) -> T {
    with_lock(mutex, std::mem::take).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[tokio::test]
    async fn test_pending_factories_taken_once() {
        let pending = Mutex::new(vec!["a", "b"]);
        assert_eq!(take_locked(&pending).await, vec!["a", "b"]);
        assert!(take_locked(&pending).await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_access_through_helpers() {
        let queue = RwLock::new(VecDeque::new());
        with_write_lock(&queue, |queue| queue.extend([1, 2, 3])).await;
        assert_eq!(with_read_lock(&queue, |queue| queue.front().copied()).await, Some(1));
        assert_eq!(with_write_lock(&queue, |queue| queue.pop_front()).await, Some(1));

        let counter = Mutex::new(0);
        with_lock(&counter, |count| *count += 2).await;
        assert_eq!(with_lock(&counter, |count| *count).await, 2);
    }
}
