//! Typed object pools with generation-checked handles.
//!
//! Owners hold handles, not pointers; a lookup revalidates the slot's
//! generation before handing out a reference. Releasing a handle bumps
//! the generation, so stale handles fail with `ArgInvalid` while any
//! outstanding references keep the object alive until the last one
//! drops (which is when the destructor runs).

use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::error::{Error, Result};
use crate::handle::{Handle, HandleType};

struct PoolSlot<T> {
    generation: u16,
    obj: Arc<T>,
}

struct PoolInner<T> {
    slab: Slab<PoolSlot<T>>,
    /// Generation per slot index, persisting across slot reuse.
    gens: Vec<u16>,
}

/// A per-interface pool for one object type.
pub struct Pool<T> {
    ty: HandleType,
    ni_index: u8,
    limit: usize,
    inner: Mutex<PoolInner<T>>,
}

impl<T> Pool<T> {
    pub fn new(ty: HandleType, ni_index: u8, limit: usize) -> Self {
        Self {
            ty,
            ni_index,
            limit,
            inner: Mutex::new(PoolInner {
                slab: Slab::new(),
                gens: Vec::new(),
            }),
        }
    }

    /// Allocate a slot for `obj`. Fails with `NoSpace` at the limit.
    pub fn alloc(&self, obj: T) -> Result<(Handle, Arc<T>)> {
        self.alloc_with(|_| obj)
    }

    /// Allocate a slot, building the object from its own handle.
    pub fn alloc_with<F: FnOnce(Handle) -> T>(&self, f: F) -> Result<(Handle, Arc<T>)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.slab.len() >= self.limit {
            return Err(Error::NoSpace);
        }
        let index = inner.slab.vacant_key();
        if inner.gens.len() <= index {
            inner.gens.resize(index + 1, 1);
        }
        let generation = inner.gens[index];
        let handle = Handle::new(self.ty, self.ni_index, generation, index as u32);
        let obj = Arc::new(f(handle));
        let key = inner.slab.insert(PoolSlot {
            generation,
            obj: obj.clone(),
        });
        debug_assert_eq!(key, index);
        Ok((handle, obj))
    }

    fn check(&self, h: Handle) -> Result<()> {
        if h.ty() != Some(self.ty) || h.ni_index() != self.ni_index {
            return Err(Error::ArgInvalid);
        }
        Ok(())
    }

    /// Resolve a handle to its object.
    pub fn lookup(&self, h: Handle) -> Result<Arc<T>> {
        self.check(h)?;
        let inner = self.inner.lock().unwrap();
        match inner.slab.get(h.index() as usize) {
            Some(slot) if slot.generation == h.generation() => Ok(slot.obj.clone()),
            _ => Err(Error::ArgInvalid),
        }
    }

    /// Free the slot. The object is destroyed when the last outstanding
    /// reference drops; subsequent lookups fail with `ArgInvalid`.
    pub fn release(&self, h: Handle) -> Result<Arc<T>> {
        self.check(h)?;
        let mut inner = self.inner.lock().unwrap();
        let index = h.index() as usize;
        match inner.slab.get(index) {
            Some(slot) if slot.generation == h.generation() => {
                let slot = inner.slab.remove(index);
                inner.gens[index] = inner.gens[index].wrapping_add(1).max(1);
                Ok(slot.obj)
            }
            _ => Err(Error::ArgInvalid),
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live handles (teardown sweeps).
    pub fn handles(&self) -> Vec<Handle> {
        let inner = self.inner.lock().unwrap();
        inner
            .slab
            .iter()
            .map(|(i, slot)| Handle::new(self.ty, self.ni_index, slot.generation, i as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_lookup_release() {
        let pool: Pool<u64> = Pool::new(HandleType::Md, 0, 16);
        let (h, obj) = pool.alloc(99).unwrap();
        assert_eq!(*obj, 99);
        assert_eq!(*pool.lookup(h).unwrap(), 99);

        pool.release(h).unwrap();
        assert!(matches!(pool.lookup(h), Err(Error::ArgInvalid)));
        assert!(matches!(pool.release(h), Err(Error::ArgInvalid)));
    }

    #[test]
    fn stale_generation_rejected() {
        let pool: Pool<u32> = Pool::new(HandleType::Ct, 0, 16);
        let (h1, _) = pool.alloc(1).unwrap();
        pool.release(h1).unwrap();
        let (h2, _) = pool.alloc(2).unwrap();
        // Slot reused, generation advanced.
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1.generation(), h2.generation());
        assert!(pool.lookup(h1).is_err());
        assert_eq!(*pool.lookup(h2).unwrap(), 2);
    }

    #[test]
    fn wrong_type_and_ni_rejected() {
        let pool: Pool<u32> = Pool::new(HandleType::Ct, 1, 16);
        let (h, _) = pool.alloc(5).unwrap();
        let wrong_ty = Handle::new(HandleType::Md, 1, h.generation(), h.index());
        let wrong_ni = Handle::new(HandleType::Ct, 0, h.generation(), h.index());
        assert!(pool.lookup(wrong_ty).is_err());
        assert!(pool.lookup(wrong_ni).is_err());
    }

    #[test]
    fn limit_enforced() {
        let pool: Pool<u8> = Pool::new(HandleType::Eq, 0, 2);
        pool.alloc(0).unwrap();
        pool.alloc(1).unwrap();
        assert!(matches!(pool.alloc(2), Err(Error::NoSpace)));
    }

    #[test]
    fn object_lives_until_last_ref() {
        let pool: Pool<String> = Pool::new(HandleType::Le, 0, 4);
        let (h, obj) = pool.alloc("hello".to_string()).unwrap();
        let extra = pool.lookup(h).unwrap();
        pool.release(h).unwrap();
        // Pool slot gone, but our references still work.
        assert_eq!(*obj, "hello");
        assert_eq!(*extra, "hello");
    }
}
