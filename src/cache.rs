//! In-memory cache of compiled kernels.
//!
//! Keyed by `(solver id, KernelKey, KernelExtra)`; the extras comparison
//! is supplied per pattern so a pattern can declare which extras are
//! semantically significant for kernel reuse. Entries hold the compiled
//! program behind an `Arc`, which carries the reference-counted lifetime:
//! a kernel stays alive for as long as the cache or any solution sequence
//! holds it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::dims::SubproblemDim;
use crate::flags::KernelExtra;
use crate::pattern::SolverId;

/// Structural identity of a compiled kernel variant, independent of where
/// the host-side handles live.
#[derive(Clone, Debug)]
pub struct KernelKey {
    pub device: ocl::Device,
    pub context: ocl::Context,
    pub nr_dims: usize,
    pub subdims: [SubproblemDim; 2],
}

impl PartialEq for KernelKey {
    fn eq(&self, other: &KernelKey) -> bool {
        self.device == other.device
            && self.context.as_core().as_ptr() == other.context.as_core().as_ptr()
            && self.nr_dims == other.nr_dims
            && self.subdims == other.subdims
    }
}

/// A compiled kernel with the immutable extras it was compiled against.
#[derive(Debug)]
pub struct CachedKernel {
    pub program: ocl::Program,
    pub name: &'static str,
    pub extra: KernelExtra,
    pub key: KernelKey,
}

/// The default comparison: everything that influences code generation.
pub fn default_kernel_extra_cmp(a: &KernelExtra, b: &KernelExtra) -> bool {
    a.dtype == b.dtype
        && a.flags == b.flags
        && a.vec_len == b.vec_len
        && a.kern_type == b.kern_type
        && a.build_options == b.build_options
}

struct Entry {
    sid: SolverId,
    kernel: Arc<CachedKernel>,
}

lazy_static! {
    static ref KERNEL_CACHE: Mutex<Vec<Entry>> = Mutex::new(Vec::new());
}

static KERNELS_CACHEABLE: AtomicBool = AtomicBool::new(true);

/// Test hook: disables kernel caching globally.
pub fn set_kernels_cacheable(cacheable: bool) {
    KERNELS_CACHEABLE.store(cacheable, Ordering::SeqCst);
}

pub fn kernels_cacheable() -> bool {
    KERNELS_CACHEABLE.load(Ordering::SeqCst)
}

/// Looks a kernel up with the pattern's extras comparator, acquiring a
/// reference for the caller.
pub fn find_kernel<F>(sid: SolverId, key: &KernelKey, extra: &KernelExtra, cmp: F) -> Option<Arc<CachedKernel>>
where
    F: Fn(&KernelExtra, &KernelExtra) -> bool,
{
    let cache = KERNEL_CACHE.lock().unwrap();
    cache
        .iter()
        .find(|e| e.sid == sid && e.kernel.key == *key && cmp(&e.kernel.extra, extra))
        .map(|e| Arc::clone(&e.kernel))
}

/// Inserts a freshly built kernel. If an equivalent entry raced in first,
/// the existing entry wins and is returned instead.
pub fn add_kernel_to_cache<F>(sid: SolverId, kernel: Arc<CachedKernel>, cmp: F) -> Arc<CachedKernel>
where
    F: Fn(&KernelExtra, &KernelExtra) -> bool,
{
    let mut cache = KERNEL_CACHE.lock().unwrap();
    if let Some(existing) = cache
        .iter()
        .find(|e| e.sid == sid && e.kernel.key == kernel.key && cmp(&e.kernel.extra, &kernel.extra))
    {
        return Arc::clone(&existing.kernel);
    }
    let out = Arc::clone(&kernel);
    cache.push(Entry { sid, kernel });
    out
}

/// Drops every cached kernel (test hook and teardown path). Kernels still
/// referenced by live solution sequences survive until those drop.
pub fn clear_kernel_cache() {
    KERNEL_CACHE.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{KernelExtraFlags, KernelType};
    use crate::types::DataType;

    #[test]
    fn default_cmp_tracks_codegen_inputs() {
        let mut a = KernelExtra::new(DataType::F32);
        let mut b = KernelExtra::new(DataType::F32);
        assert!(default_kernel_extra_cmp(&a, &b));

        b.flags = KernelExtraFlags::TRANS_A;
        assert!(!default_kernel_extra_cmp(&a, &b));

        b.flags = KernelExtraFlags::empty();
        b.vec_len = 4;
        a.vec_len = 2;
        assert!(!default_kernel_extra_cmp(&a, &b));

        a.vec_len = 4;
        a.kern_type = KernelType::PrepA;
        b.kern_type = KernelType::PrepA;
        assert!(default_kernel_extra_cmp(&a, &b));
    }

    #[test]
    fn cacheability_toggle() {
        assert!(kernels_cacheable());
        set_kernels_cacheable(false);
        assert!(!kernels_cacheable());
        set_kernels_cacheable(true);
    }
}
