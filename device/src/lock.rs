use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use futures::{
    channel::oneshot::{channel, Receiver, Sender},
    lock::{Mutex, MutexGuard},
};

pub use spin::Mutex as SpinMutex;

#[derive(Debug)]
pub enum SharedLockError {
    /// Already locked
    AlreadyLocked,
    /// Already unlocked
    AlreadyUnlocked,
    /// Cannot acquire shared lock due to other shared lock
    LockedByShared,
    /// Cannot acquire exclusive lock due to other exclusive lock
    LockedByExclusive,
    /// Device is used by other session but not locked
    Busy,
    /// Timed out
    Timeout,
}

#[derive(Debug)]
pub enum SharedLockMode {
    Shared,
    Exclusive,
}

/// Lock state shared by all sessions of one instrument endpoint.
pub struct SharedLock {
    shared_lock: Option<String>,
    num_shared_locks: u32,
    exclusive_lock: bool,
    event: Vec<Sender<()>>,
}

impl SharedLock {
    pub fn new() -> Arc<SpinMutex<SharedLock>> {
        Arc::new(SpinMutex::new(SharedLock {
            shared_lock: None,
            num_shared_locks: 0,
            exclusive_lock: false,
            event: Vec::new(),
        }))
    }

    /// Get the shared lock's num shared locks.
    #[must_use]
    pub fn num_shared_locks(&self) -> u32 {
        self.num_shared_locks
    }

    /// Get the shared lock's exclusive lock.
    #[must_use]
    pub fn exclusive_lock(&self) -> bool {
        self.exclusive_lock
    }

    fn notify(&mut self) {
        for sender in self.event.drain(..) {
            let _ = sender.send(());
        }
    }

    fn listen(&mut self) -> Receiver<()> {
        let (sender, receiver) = channel();
        self.event.push(sender);
        receiver
    }
}

/// Per-session lock acquisition flags.
struct HandleState {
    has_shared: bool,
    has_exclusive: bool,
}

/// A per-session handle to a lockable device.
///
/// Clones share the session's acquisition state, so the synchronous and
/// asynchronous channel of one session may each hold a clone. The session
/// owner **MUST** call [LockHandle::force_release] when the session ends.
pub struct LockHandle<DEV> {
    parent: Arc<SpinMutex<SharedLock>>,
    device: Arc<Mutex<DEV>>,
    state: Arc<SpinMutex<HandleState>>,
}

impl<DEV> Clone for LockHandle<DEV> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            device: self.device.clone(),
            state: self.state.clone(),
        }
    }
}

impl<DEV> LockHandle<DEV> {
    pub fn new(parent: Arc<SpinMutex<SharedLock>>, device: Arc<Mutex<DEV>>) -> Self {
        LockHandle {
            parent,
            device,
            state: Arc::new(SpinMutex::new(HandleState {
                has_shared: false,
                has_exclusive: false,
            })),
        }
    }

    /// Get the underlying device.
    pub fn device(&self) -> Arc<Mutex<DEV>> {
        self.device.clone()
    }

    /// Checks if the device is available to try and lock. I.e. this handle holds a lock,
    /// no other session holds an exclusive lock or no locks are active.
    /// Another session may still be using the device if no locks are active.
    pub fn can_lock(&self) -> Result<(), SharedLockError> {
        let shared = self.parent.lock();
        let state = self.state.lock();
        if state.has_exclusive {
            // I have an exclusive lock
            Ok(())
        } else if state.has_shared {
            // I have a shared lock
            if shared.exclusive_lock {
                // Someone else have acquired an exclusive
                Err(SharedLockError::LockedByExclusive)
            } else {
                Ok(())
            }
        } else {
            // I do not have any locks
            // Check if anyone else have one?
            if shared.exclusive_lock {
                Err(SharedLockError::LockedByExclusive)
            } else if shared.num_shared_locks > 0 {
                Err(SharedLockError::LockedByShared)
            } else {
                Ok(())
            }
        }
    }

    /// Try to acquire a lock. An empty lock string requests an exclusive lock,
    /// anything else a shared lock keyed by the string.
    pub fn try_acquire(&self, lockstr: &str) -> Result<(), SharedLockError> {
        if lockstr.is_empty() {
            self.try_acquire_exclusive()
        } else {
            self.try_acquire_shared(lockstr)
        }
    }

    /// Acquire a lock asynchronously, waiting until other sessions release theirs.
    pub async fn async_acquire(&self, lockstr: &str) -> Result<(), SharedLockError> {
        let mut listener = None;

        loop {
            match self.try_acquire(lockstr) {
                Ok(()) => break Ok(()),
                Err(SharedLockError::LockedByShared) | Err(SharedLockError::LockedByExclusive) => {
                    match listener.take() {
                        None => {
                            // Start listening and then try locking again.
                            listener = Some(self.listen());
                        }
                        Some(l) => {
                            // Wait until a notification is received.
                            let _ = l.await;
                        }
                    }
                }
                Err(err) => {
                    break Err(err);
                }
            }
        }
    }

    /// Try to acquire an exclusive lock.
    /// Returns immediately once it has polled the lock with success or error.
    pub fn try_acquire_exclusive(&self) -> Result<(), SharedLockError> {
        let mut shared = self.parent.lock();
        let mut state = self.state.lock();

        if state.has_exclusive {
            return Err(SharedLockError::AlreadyLocked);
        }

        match (shared.exclusive_lock, &shared.shared_lock) {
            // Current state: Unlocked
            (false, None) => {
                shared.exclusive_lock = true;
                state.has_exclusive = true;

                shared.notify();
                Ok(())
            }
            // Current state: Exclusively locked
            (true, _) => Err(SharedLockError::LockedByExclusive),
            // Current state: Shared lock
            (false, Some(_)) => {
                if state.has_shared {
                    shared.exclusive_lock = true;
                    state.has_exclusive = true;

                    shared.notify();
                    Ok(())
                } else {
                    Err(SharedLockError::LockedByShared)
                }
            }
        }
    }

    pub fn try_acquire_shared(&self, lockstr: &str) -> Result<(), SharedLockError> {
        let mut shared = self.parent.lock();
        let mut state = self.state.lock();

        if state.has_shared {
            return Err(SharedLockError::AlreadyLocked);
        }

        match (shared.exclusive_lock, &shared.shared_lock) {
            // Current state: Unlocked
            (false, None) => {
                shared.shared_lock = Some(lockstr.to_string());
                shared.num_shared_locks = 1;
                state.has_shared = true;

                shared.notify();
                Ok(())
            }
            // Current state: Exclusively locked
            (true, None) => {
                if state.has_exclusive {
                    Err(SharedLockError::AlreadyLocked)
                } else {
                    Err(SharedLockError::LockedByExclusive)
                }
            }
            // Current state: Shared lock or both locks
            (_, Some(key)) => {
                if key == lockstr {
                    shared.num_shared_locks += 1;
                    state.has_shared = true;

                    shared.notify();
                    Ok(())
                } else {
                    Err(SharedLockError::LockedByShared)
                }
            }
        }
    }

    /// Release any locks being held.
    /// Returns an error if no locks are held by this handle.
    pub fn try_release(&self) -> Result<SharedLockMode, SharedLockError> {
        let mut shared = self.parent.lock();
        let mut state = self.state.lock();
        let mut res = Err(SharedLockError::AlreadyUnlocked);

        // Release my shared lock
        if state.has_shared {
            shared.num_shared_locks -= 1;
            if shared.num_shared_locks == 0 {
                shared.shared_lock = None;
            }
            state.has_shared = false;
            res = Ok(SharedLockMode::Shared);
        }

        // Release my exclusive lock
        if state.has_exclusive {
            shared.exclusive_lock = false;
            state.has_exclusive = false;
            res = Ok(SharedLockMode::Exclusive);
        }

        // Notify others waiting that lock might be available
        if res.is_ok() {
            shared.notify();
        }

        res
    }

    /// Force release both shared and exclusive locks.
    /// Same as try_release but ignores any error.
    pub fn force_release(&self) {
        let _res = self.try_release();
    }

    /// Lock state as reported by AsyncLockInfo: whether this session holds an
    /// exclusive lock, and how many sessions share a shared lock.
    pub fn lock_info(&self) -> (bool, u32) {
        let shared = self.parent.lock();
        let state = self.state.lock();
        (state.has_exclusive, shared.num_shared_locks)
    }

    /// Get the lock handle's has shared.
    #[must_use]
    pub fn has_shared(&self) -> bool {
        self.state.lock().has_shared
    }

    /// Get the lock handle's has exclusive.
    #[must_use]
    pub fn has_exclusive(&self) -> bool {
        self.state.lock().has_exclusive
    }

    fn listen(&self) -> Receiver<()> {
        self.parent.lock().listen()
    }

    /// Check if the shared lock is available and then lock.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, DEV>, SharedLockError> {
        // Check any active locks
        self.can_lock()?;
        // Lock device and return a guard
        self.device.try_lock().ok_or(SharedLockError::Busy)
    }

    /// Lock the device once this session is allowed to, waiting for other
    /// sessions to release their locks if necessary.
    pub async fn async_lock(&self) -> MutexGuard<'_, DEV> {
        let mut listener = None;

        loop {
            match self.can_lock() {
                // Allowed to try and lock
                Ok(()) => {
                    let mut l = self.listen();

                    futures::select! {
                        // Device acquired
                        guard = self.device.lock() => break guard,
                        // Interrupted by a new lock being granted/released
                        _event = l => continue
                    }
                }
                // Currently locked by someone else
                Err(_) => {
                    match listener.take() {
                        None => {
                            // Start listening and then try locking again.
                            listener = Some(self.listen());
                        }
                        Some(l) => {
                            // Wait until a notification is received.
                            let _ = l.await;
                        }
                    }
                }
            }
        }
    }

    /// Lock the device regardless of session locks.
    /// Used for device clear and status reads which bypass lock arbitration.
    pub async fn inner_lock(&self) -> MutexGuard<'_, DEV> {
        self.device.lock().await
    }
}
