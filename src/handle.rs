//! Generation-checked handles into fixed-capacity slot arrays.
//!
//! Every long-lived GPU object the renderer hands out (textures, pending
//! destruction records) lives in a [`HandleManager`]. A [`Handle`] is a plain
//! `{index, generation}` pair; it stays cheap to copy and never keeps the
//! value alive. When a slot is freed and reused its generation changes, so a
//! handle captured before the removal can never alias the new value.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

const INVALID_INDEX: u32 = u32::MAX;

/// Non-owning reference to a value stored in a [`HandleManager<T>`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The default, never-valid handle.
    pub const fn invalid() -> Self {
        Self {
            index: INVALID_INDEX,
            generation: 0,
            _marker: PhantomData,
        }
    }

    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether this handle was ever issued by a manager.
    ///
    /// This does not check liveness; use [`HandleManager::is_valid`] for that.
    pub fn is_set(&self) -> bool {
        self.index != INVALID_INDEX
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "Handle({}v{})", self.index, self.generation)
        } else {
            write!(f, "Handle(invalid)")
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    next_generation: u32,
    live: usize,
}

impl<T> Slots<T> {
    fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    fn release(&mut self, index: usize) -> Option<T> {
        let value = self.slots[index].value.take();
        if value.is_some() {
            self.free.push(index as u32);
            self.live -= 1;
        }
        value
    }
}

/// Thread-safe, fixed-capacity arena addressed by [`Handle<T>`].
///
/// Mutations take the exclusive lock, lookups take the shared lock.
pub struct HandleManager<T> {
    inner: RwLock<Slots<T>>,
    capacity: u32,
}

impl<T> HandleManager<T> {
    pub fn new(capacity: u32) -> Self {
        debug_assert!(capacity < INVALID_INDEX);
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::with_capacity(capacity as usize),
                free: Vec::new(),
                next_generation: 0,
                live: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `value` and return its handle.
    ///
    /// Freed slots are reused before new ones are claimed. Returns an invalid
    /// handle once the manager is full; the value is dropped in that case.
    pub fn add(&self, value: T) -> Handle<T> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None if (inner.slots.len() as u32) < self.capacity => {
                inner.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                inner.slots.len() as u32 - 1
            }
            None => return Handle::invalid(),
        };

        inner.next_generation = inner.next_generation.wrapping_add(1).max(1);
        let generation = inner.next_generation;
        let slot = &mut inner.slots[index as usize];
        slot.generation = generation;
        slot.value = Some(value);
        inner.live += 1;
        Handle::new(index, generation)
    }

    /// Store `T::default()` and return its handle.
    pub fn create(&self) -> Handle<T>
    where
        T: Default,
    {
        self.add(T::default())
    }

    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        self.inner.read().get(handle).is_some()
    }

    /// Shared access to a live value.
    ///
    /// # Panics
    ///
    /// Panics when `handle` is stale or invalid; that is a use-after-free in
    /// the caller.
    pub fn access(&self, handle: Handle<T>) -> MappedRwLockReadGuard<'_, T> {
        self.try_access(handle).unwrap_or_else(|| stale_handle(handle))
    }

    /// Exclusive access to a live value.
    ///
    /// # Panics
    ///
    /// Panics when `handle` is stale or invalid.
    pub fn access_mut(&self, handle: Handle<T>) -> MappedRwLockWriteGuard<'_, T> {
        self.try_access_mut(handle).unwrap_or_else(|| stale_handle(handle))
    }

    pub fn try_access(&self, handle: Handle<T>) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.inner.read(), |inner| inner.get(handle)).ok()
    }

    pub fn try_access_mut(&self, handle: Handle<T>) -> Option<MappedRwLockWriteGuard<'_, T>> {
        RwLockWriteGuard::try_map(self.inner.write(), |inner| inner.get_mut(handle)).ok()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<T>
    where
        T: Clone,
    {
        self.inner.read().get(handle).cloned()
    }

    /// Replace the value behind `handle`, returning the previous one.
    ///
    /// A stale handle leaves the manager untouched and hands `value` back in
    /// `Err`, so background producers racing a teardown can dispose of it.
    pub fn update(&self, handle: Handle<T>, value: T) -> Result<T, T> {
        let mut inner = self.inner.write();
        match inner.get_mut(handle) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(value),
        }
    }

    /// Remove the value and reset `handle` to the invalid handle.
    pub fn remove(&self, handle: &mut Handle<T>) -> Option<T> {
        let removed = {
            let mut inner = self.inner.write();
            if inner.get(*handle).is_some() {
                inner.release(handle.index as usize)
            } else {
                None
            }
        };
        *handle = Handle::invalid();
        removed
    }

    /// Remove and return every value matching `pred`, under a single lock.
    pub fn extract_if(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut inner = self.inner.write();
        let mut extracted = Vec::new();
        for index in 0..inner.slots.len() {
            let matches = inner.slots[index].value.as_ref().is_some_and(&mut pred);
            if matches {
                if let Some(value) = inner.release(index) {
                    extracted.push(value);
                }
            }
        }
        extracted
    }

    /// Remove and return every live value.
    pub fn drain(&self) -> Vec<T> {
        self.extract_if(|_| true)
    }

    pub fn for_each(&self, mut f: impl FnMut(Handle<T>, &T)) {
        let inner = self.inner.read();
        for (index, slot) in inner.slots.iter().enumerate() {
            if let Some(value) = &slot.value {
                f(Handle::new(index as u32, slot.generation), value);
            }
        }
    }
}

impl<T> fmt::Debug for HandleManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleManager")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cold]
fn stale_handle<T>(handle: Handle<T>) -> ! {
    let message = format!(
        "access through stale or invalid {:?} ({})",
        handle,
        std::any::type_name::<T>()
    );
    log::error!(target: "critical", "{}", message);
    panic!("{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_access() {
        let manager = HandleManager::new(4);
        let handle = manager.add(String::from("albedo"));
        assert!(manager.is_valid(handle));
        assert_eq!(*manager.access(handle), "albedo");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_capacity_and_reuse() {
        let manager = HandleManager::<i32>::new(3);
        let h1 = manager.add(1);
        let mut h2 = manager.add(2);
        let h3 = manager.add(3);
        assert!(manager.is_valid(h1) && manager.is_valid(h2) && manager.is_valid(h3));

        let h4 = manager.add(4);
        assert!(!h4.is_set());
        assert_eq!(*manager.access(h1), 1);
        assert_eq!(*manager.access(h3), 3);

        let stale = h2;
        assert_eq!(manager.remove(&mut h2), Some(2));
        assert_eq!(h2, Handle::invalid());

        let h5 = manager.add(5);
        assert!(manager.is_valid(h5));
        assert_eq!(h5.index(), stale.index());
        assert!(h5.generation() > stale.generation());
        assert!(!manager.is_valid(stale));
        assert!(manager.try_access(stale).is_none());
        assert_eq!(*manager.access(h5), 5);
    }

    #[test]
    #[should_panic(expected = "stale or invalid")]
    fn test_access_after_remove_panics() {
        let manager = HandleManager::new(2);
        let mut handle = manager.add(7u64);
        let copy = handle;
        manager.remove(&mut handle);
        let _ = manager.access(copy);
    }

    #[test]
    fn test_update_ignores_stale_handle() {
        let manager = HandleManager::new(2);
        let mut handle = manager.add(10);
        assert_eq!(manager.update(handle, 11), Ok(10));
        assert_eq!(manager.get(handle), Some(11));

        let stale = handle;
        manager.remove(&mut handle);
        let fresh = manager.add(20);
        assert_eq!(manager.update(stale, 99), Err(99));
        assert_eq!(manager.get(fresh), Some(20));
    }

    #[test]
    fn test_create_uses_default() {
        let manager = HandleManager::<Vec<u8>>::new(1);
        let handle = manager.create();
        assert!(manager.access(handle).is_empty());
        manager.access_mut(handle).push(3);
        assert_eq!(manager.get(handle), Some(vec![3]));
    }

    #[test]
    fn test_extract_if_frees_slots() {
        let manager = HandleManager::new(8);
        for i in 0..8 {
            manager.add(i);
        }
        let mut even = manager.extract_if(|v| v % 2 == 0);
        even.sort();
        assert_eq!(even, vec![0, 2, 4, 6]);
        assert_eq!(manager.len(), 4);

        for i in 0..4 {
            assert!(manager.add(100 + i).is_set());
        }
        assert!(!manager.add(200).is_set());
        assert_eq!(manager.drain().len(), 8);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let manager = Arc::new(HandleManager::new(256));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let mut handles = Vec::new();
                    for i in 0..64 {
                        let h = manager.add(t * 1000 + i);
                        assert!(h.is_set());
                        handles.push((h, t * 1000 + i));
                    }
                    for (h, v) in &handles {
                        assert_eq!(*manager.access(*h), *v);
                    }
                    for (mut h, v) in handles {
                        assert_eq!(manager.remove(&mut h), Some(v));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(manager.is_empty());
    }
}
