//! Store-backed tuning flow without a device: a candidate search feeds a
//! winner into the store, and the granulation chooser picks it up.

use crate::flags::KernelExtraFlags;
use crate::pattern::SOLVERS;
use crate::storage::tests::synthetic_device;
use crate::storage::{StorageCache, BANK_ALIGNED_RECORD_IDX, DIMENSION_COUNT};
use crate::tune::candidates::CandidateSet;
use crate::types::{BlasFunction, DataType};

/// A simulated tuning pass: enumerate candidates for one GEMM record,
/// "time" them with a synthetic cost, persist the winner, and read it
/// back through a fresh cache.
#[test]
fn winner_writeback_round_trip() {
    let desc = synthetic_device();
    let dir = tempfile::tempdir().unwrap();
    let mut cache = StorageCache::for_device_in_dir(&desc, Some(dir.path()));
    cache.write_full().unwrap();

    let pattern = SOLVERS.function(BlasFunction::Gemm).pattern(0);
    let mut set = CandidateSet::new(
        BlasFunction::Gemm,
        pattern,
        DataType::F32,
        KernelExtraFlags::empty(),
        desc.lds_size,
        desc.max_work_group_size,
        desc.wavefront,
    );
    assert!(!set.is_empty());

    // Synthetic cost favors wide inner blocks.
    let cost = |ids: [usize; 6]| 64.0 / (1.0 + ids[5] as f64);

    let max = 16.min(set.len());
    loop {
        let t = cost(set.current().ids);
        if !set.next(max, t) {
            break;
        }
    }
    let (best, best_time) = set.best().expect("some candidate must have been timed");
    let (subdims, pgran) = set.decomposition(best);

    let path = cache
        .find_param("BufferGemm", DataType::F32, KernelExtraFlags::empty(), 3000)
        .unwrap();
    {
        let param = cache.param_mut(path);
        param.subdims = subdims;
        param.pgran = pgran;
        param.time = best_time;
    }
    cache.save_best_param(path).unwrap();

    // A fresh cache sees the tuned record with finite time and a valid
    // granulation.
    let mut fresh = StorageCache::for_device_in_dir(&desc, Some(dir.path()));
    fresh.load().unwrap();
    let param = fresh.param(path);
    assert!(param.has_data());
    assert!(param.time.is_finite());
    assert!(param.pgran.is_valid());
    assert_eq!(param.pgran.group_size(), 64);
    assert_eq!(param.subdims[0].x % param.subdims[1].item_x, 0);
}

/// Records are bucketed per (pattern, dtype, masked flags); the tuned
/// record must be reachable under any flag value that masks down to the
/// tuned one.
#[test]
fn tuning_mask_shares_lookups() {
    let desc = synthetic_device();
    let cache = StorageCache::for_device_in_dir(&desc, None);

    let base = cache
        .find_param("BufferGemm", DataType::F32, KernelExtraFlags::empty(), 2000)
        .unwrap();

    // Tail and offset bits are outside the GEMM tuning mask, so the same
    // record answers.
    let noisy = KernelExtraFlags::TAILS_M
        | KernelExtraFlags::TAILS_N_LOWER
        | KernelExtraFlags::A_OFF_NOT_ZERO
        | KernelExtraFlags::BETA_ZERO;
    let shared = cache
        .find_param("BufferGemm", DataType::F32, noisy, 2000)
        .unwrap();
    assert_eq!(base, shared);

    // A transposition is inside the mask and lands elsewhere.
    let transposed = cache
        .find_param(
            "BufferGemm",
            DataType::F32,
            KernelExtraFlags::TRANS_A,
            2000,
        )
        .unwrap();
    assert_ne!(base.extra, transposed.extra);
}

/// Every extra carries the full bucket ladder, and the bank-aligned
/// record keeps its reserved slot at the end.
#[test]
fn bucket_ladders_are_complete() {
    let desc = synthetic_device();
    let cache = StorageCache::for_device_in_dir(&desc, None);

    for func in BlasFunction::all().iter() {
        let record = &cache.functions[func.index()];
        assert_eq!(
            record.patterns.len(),
            SOLVERS.function(*func).nr_patterns()
        );
        for patt in &record.patterns {
            for extra in &patt.extras {
                assert_eq!(extra.params.len(), DIMENSION_COUNT);
                // Buckets grow with their index, except the reserved
                // bank-aligned slot.
                for w in extra.params[..BANK_ALIGNED_RECORD_IDX].windows(2) {
                    assert!(w[0].dim <= w[1].dim);
                }
            }
        }
    }
}
