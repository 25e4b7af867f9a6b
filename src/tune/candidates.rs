//! Candidate decompositions for the autotuner: the power-of-two search
//! grid, the generic validity rules, and the weighted-group estimator
//! that prunes the search.

use crate::dims::{PGranularity, SubproblemDim, MAX_SUBDIMS, SUBDIM_UNUSED};
use crate::flags::{flags_to_args, KernelExtraFlags};
use crate::kargs::ProblemArgs;
use crate::pattern::{is_matrix_access_col_maj, DecompMode, MemoryPattern};
use crate::dims::SolverFlags;
use crate::types::{BlasFunction, DataType, MatrixRole};

/// The six tuned variables.
pub const V_COUNT: usize = 6;

const V_L0_X: usize = 0;
const V_L0_Y: usize = 1;
const V_L0_BW: usize = 2;
const V_L1_X: usize = 3;
const V_L1_Y: usize = 4;
const V_L1_BW: usize = 5;

static POW2: [usize; 13] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// One candidate: value indices per variable plus its bookkeeping.
#[derive(Clone, Debug)]
pub struct Variant {
    pub ids: [usize; V_COUNT],
    pub time: f64,
    min_time: f64,
    weight: f64,
}

/// Statistics of one pruning group: candidates sharing a pinned subset of
/// variable values.
#[derive(Clone, Debug)]
struct GroupStat {
    pinned: [Option<usize>; V_COUNT],
    all_count: usize,
    count: usize,
    min_time: f64,
    all_time: f64,
}

impl GroupStat {
    fn contains(&self, v: &Variant) -> bool {
        self.pinned
            .iter()
            .zip(v.ids.iter())
            .all(|(p, id)| p.map_or(true, |pv| pv == *id))
    }
}

/// Expected minimum achievable time within a group, scaled down while the
/// group is sparsely measured.
fn min_expected_time_for_group(g: &GroupStat) -> f64 {
    const K_INCREASE: f64 = 1.5;
    const K_GLOBAL: f64 = 0.97;

    let m = g.all_count as f64;
    let i = g.count as f64;
    if i == 0.0 {
        return 0.0;
    }

    let ki = 1.0 / ((K_INCREASE + K_INCREASE / (m + i) - 1.0) / i + (m - K_INCREASE) / (m + 1.0));
    let average = g.all_time / m;
    let kdelta = (g.min_time * 3.0) / (g.min_time * 2.0 + average);
    K_GLOBAL * kdelta * ki * g.min_time
}

/// The candidate set for one (function, pattern, dtype, flags, device)
/// combination.
pub struct CandidateSet {
    func: BlasFunction,
    pattern: &'static MemoryPattern,
    dtype: DataType,
    flags: KernelExtraFlags,
    lds_size: u64,
    max_work_group_size: usize,
    wavefront: u32,

    is_2d: bool,
    square: bool,

    variants: Vec<Variant>,
    groups: Vec<GroupStat>,
    cur: usize,
    count: usize,
    min_time: f64,
    sum_time: f64,
    /// Visit every candidate in order instead of estimating.
    pub return_all: bool,
}

fn grids(level: u32) -> [&'static [usize]; V_COUNT] {
    if level == 2 {
        [
            &POW2[0..1],  // l0.x
            &POW2[4..10], // l0.y
            &POW2[0..10], // l0.bw
            &POW2[0..1],  // l1.x
            &POW2[1..7],  // l1.y
            &POW2[0..6],  // l1.bw
        ]
    } else {
        [
            &POW2[4..8], // l0.x
            &POW2[4..8], // l0.y
            &POW2[0..6], // l0.bw
            &POW2[0..6], // l1.x
            &POW2[0..6], // l1.y
            &POW2[0..6], // l1.bw
        ]
    }
}

impl CandidateSet {
    pub fn new(
        func: BlasFunction,
        pattern: &'static MemoryPattern,
        dtype: DataType,
        flags: KernelExtraFlags,
        lds_size: u64,
        max_work_group_size: usize,
        wavefront: u32,
    ) -> CandidateSet {
        let sflags = pattern.sops.flags();
        let mut set = CandidateSet {
            func,
            pattern,
            dtype,
            flags,
            lds_size,
            max_work_group_size,
            wavefront,
            is_2d: sflags.contains(SolverFlags::WSPACE_2D),
            square: sflags.contains(SolverFlags::TOP_INPUT_SQUARE_BLOCKS),
            variants: Vec::new(),
            groups: Vec::new(),
            cur: 0,
            count: 0,
            min_time: 9999.0,
            sum_time: 0.0,
            return_all: true,
        };
        set.enumerate();
        set.init_groups();
        set
    }

    /// Walks the full grid once, keeping the candidates that validate.
    fn enumerate(&mut self) {
        let grid = grids(self.func.blas_level());
        let mut ids = [0usize; V_COUNT];

        'odometer: loop {
            let v = Variant {
                ids,
                time: 0.0,
                min_time: 0.0,
                weight: 10.0,
            };
            if self.is_variant_valid(&v) {
                self.variants.push(v);
            }

            // Advance the last variable first.
            for i in (0..V_COUNT).rev() {
                ids[i] += 1;
                if ids[i] < grid[i].len() {
                    continue 'odometer;
                }
                ids[i] = 0;
            }
            break;
        }
    }

    fn init_groups(&mut self) {
        //                 l0.x   l0.y   l0.bw  l1.x   l1.y   l1.bw
        let masks: [[bool; V_COUNT]; 4] = [
            [true, true, false, false, false, false],
            [true, true, true, false, false, false],
            [false, false, false, true, true, true],
            [true, true, false, true, true, false],
        ];

        for mask in masks.iter() {
            let start = self.groups.len();
            for vi in 0..self.variants.len() {
                let ids = self.variants[vi].ids;
                let mut found = false;
                for g in &mut self.groups[start..] {
                    if g.contains(&self.variants[vi]) {
                        g.all_count += 1;
                        found = true;
                        break;
                    }
                }
                if !found {
                    let mut pinned = [None; V_COUNT];
                    for (k, &m) in mask.iter().enumerate() {
                        if m {
                            pinned[k] = Some(ids[k]);
                        }
                    }
                    self.groups.push(GroupStat {
                        pinned,
                        all_count: 1,
                        count: 0,
                        min_time: 1e9,
                        all_time: 0.0,
                    });
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn current(&self) -> &Variant {
        &self.variants[self.cur]
    }

    fn values(&self, v: &Variant) -> [usize; V_COUNT] {
        let grid = grids(self.func.blas_level());
        let mut out = [0usize; V_COUNT];
        for i in 0..V_COUNT {
            out[i] = grid[i][v.ids[i]];
        }
        out
    }

    /// The decomposition and granularity of a variant.
    pub fn decomposition(&self, v: &Variant) -> ([SubproblemDim; MAX_SUBDIMS], PGranularity) {
        let vals = self.values(v);
        let tsize = self.dtype.size();
        let mut dims = [SubproblemDim::default(); MAX_SUBDIMS];

        dims[0].x = vals[V_L0_X];
        dims[0].item_x = vals[V_L0_X];
        dims[0].y = vals[V_L0_Y];
        dims[0].item_y = vals[V_L0_Y];
        dims[0].bwidth = vals[V_L0_BW];

        dims[1].x = vals[V_L1_X];
        dims[1].item_x = vals[V_L1_X];
        dims[1].y = vals[V_L1_Y];
        dims[1].item_y = vals[V_L1_Y];
        dims[1].bwidth = vals[V_L1_BW] / (tsize / 4).max(1);

        if self.func.has_triangular_matrix() && !self.is_2d {
            dims[0].item_y = SUBDIM_UNUSED;
        }

        let has_pattern_calc = self
            .pattern
            .sops
            .check_calc_decomp(
                &mut PGranularity::default(),
                &mut dims.clone(),
                2,
                self.dtype,
                DecompMode::Check,
            )
            .is_some();

        if self.func.blas_level() == 2 {
            let x_blocks = dims[0].x / dims[1].x.max(1);
            dims[0].x = 1;
            dims[1].item_x = 1;
            dims[1].x = 1;
            if !has_pattern_calc {
                dims[0].bwidth = dims[1].bwidth * x_blocks.max(1);
            }
        }

        let mut pgran = PGranularity {
            wg_dim: 2,
            wg_size: [1, 1],
            wf_size: self.wavefront,
            max_work_group_size: self.max_work_group_size as u32,
        };

        if self
            .pattern
            .sops
            .check_calc_decomp(&mut pgran, &mut dims, 2, self.dtype, DecompMode::Calc)
            .is_none()
        {
            pgran.wg_size[1] = (dims[0].x / dims[1].item_x.max(1)).max(1) as u32;
            pgran.wg_size[0] = (dims[0].y / dims[1].item_y.max(1)).max(1) as u32;
            if !self.is_2d {
                pgran.wg_dim = 1;
                pgran.wg_size[0] *= pgran.wg_size[1];
                pgran.wg_size[1] = 1;
            }
        }

        (dims, pgran)
    }

    /// The generic validity rules; a pattern with its own
    /// `check_calc_decomp` replaces them outright.
    fn is_variant_valid(&self, v: &Variant) -> bool {
        let (mut dims, mut pgran) = self.decomposition(v);

        if let Some(ok) = self.pattern.sops.check_calc_decomp(
            &mut pgran,
            &mut dims,
            2,
            self.dtype,
            DecompMode::Check,
        ) {
            return ok;
        }

        let tsize = self.dtype.size();
        let min_item = (16 / tsize).max(1);
        let l0 = dims[0];
        let l1 = dims[1];
        let wg_x = pgran.wg_size[0] as usize;
        let wg_y = pgran.wg_size[1] as usize;

        if l1.y < min_item {
            return false;
        }

        if self.func.blas_level() == 3 {
            let col_a = is_matrix_access_col_maj(self.func, self.flags, MatrixRole::A);
            let col_b = is_matrix_access_col_maj(self.func, self.flags, MatrixRole::B);
            if !col_a || !col_b {
                // Small block widths thrash when either input walks rows.
                if l1.bwidth < min_item || l0.y >= 128 || l0.x >= 128 {
                    return false;
                }
            }
        }

        if l1.bwidth == 0 {
            return false;
        }
        if l0.bwidth % l1.bwidth != 0 {
            return false;
        }
        if wg_x * wg_y != self.wavefront as usize {
            return false;
        }

        if self.func.blas_level() == 2 {
            if l0.y <= l1.y {
                return false;
            }
        } else {
            if l0.x <= l1.x || l0.y <= l1.y || l1.x < min_item {
                return false;
            }
        }

        if self.is_2d {
            if wg_y * l1.item_x != l0.x || wg_x * l1.item_y != l0.y {
                return false;
            }
        }

        if self.square && !(l0.x == l0.y && l0.x == l0.bwidth) {
            return false;
        }

        // Register-pressure estimate over the per-thread tile.
        let regs = (l1.x * l1.bwidth + l1.y * l1.bwidth + l1.x * l1.y) * tsize / 16;
        if regs > 64 {
            return false;
        }

        if self.pattern.sops.is_fit_to_lds(&dims, self.dtype, self.lds_size, &self.args_for_flags())
            == Some(false)
        {
            return false;
        }

        true
    }

    fn args_for_flags(&self) -> ProblemArgs {
        let mut args = ProblemArgs::new(self.dtype);
        flags_to_args(&mut args, self.flags, self.func);
        args
    }

    /// Feeds the measured time of the current candidate and moves to the
    /// next one. `max_param` bounds the total number of candidates tried.
    pub fn next(&mut self, max_param: usize, time: f64) -> bool {
        if self.variants.is_empty() || self.count >= max_param {
            return false;
        }

        if self.return_all {
            self.variants[self.cur].time = time;
            if time > 0.0 {
                self.min_time = self.min_time.min(time);
            }
            self.count += 1;
            if self.cur + 1 < self.variants.len() && self.count < max_param {
                self.cur += 1;
                true
            } else {
                false
            }
        } else {
            self.next_weighted(max_param, time)
        }
    }

    fn next_weighted(&mut self, max_param: usize, time: f64) -> bool {
        const MAX_WEIGHT: f64 = 99.0;

        self.variants[self.cur].time = time;
        self.sum_time += time;
        let mid_time = self.sum_time / (self.count as f64 + 1.0);
        if time > 0.0 {
            self.min_time = self.min_time.min(time);
        }
        let max_time = (2.1 * mid_time - self.min_time).max(self.min_time * 5.0);

        for g in &mut self.groups {
            g.all_time = 0.0;
            g.count = 0;
            g.min_time = 1e9;
        }

        // Group statistics over the measured candidates.
        for vi in 0..self.variants.len() {
            if self.variants[vi].time > 0.0 {
                let vtime = self.variants[vi].time;
                for g in &mut self.groups {
                    if g.contains(&self.variants[vi]) {
                        g.min_time = g.min_time.min(vtime);
                        g.all_time += vtime.min(max_time);
                        g.count += 1;
                        g.min_time = min_expected_time_for_group(g);
                    }
                }
            }
            self.variants[vi].min_time = 0.0;
            self.variants[vi].weight = MAX_WEIGHT;
        }

        // Lower-bound estimate per unmeasured candidate.
        for vi in 0..self.variants.len() {
            if self.variants[vi].time != 0.0 {
                continue;
            }
            let mut kgroup = 1.0;
            let mut min_time = 0.0f64;
            let mut weight = MAX_WEIGHT;
            for g in &self.groups {
                if g.contains(&self.variants[vi]) {
                    if g.count > 0 {
                        min_time = min_time.max(g.min_time);
                        weight = self.min_time / min_time.max(1e-12);
                    } else {
                        // Unmeasured groups make the estimate optimistic.
                        kgroup *= 1.1;
                    }
                }
            }
            self.variants[vi].weight = weight * kgroup;
            self.variants[vi].min_time = min_time / kgroup;
        }

        // The next candidate is the unmeasured one with the best chance
        // of beating the global minimum.
        let mut best: Option<usize> = None;
        let mut best_weight = -5000.0;
        for vi in 0..self.variants.len() {
            let v = &self.variants[vi];
            if v.time == 0.0 && v.weight >= 0.01 && v.weight > best_weight {
                best_weight = v.weight;
                best = Some(vi);
            }
        }

        match best {
            Some(vi) if self.count < max_param => {
                self.cur = vi;
                self.count += 1;
                true
            }
            _ => false,
        }
    }

    /// The best measured variant so far.
    pub fn best(&self) -> Option<(&Variant, f64)> {
        self.variants
            .iter()
            .filter(|v| v.time > 0.0)
            .min_by(|a, b| a.time.partial_cmp(&b.time).unwrap())
            .map(|v| (v, v.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::SOLVERS;
    use crate::types::DataType;

    fn set_for(func: BlasFunction, pattern: usize, dtype: DataType) -> CandidateSet {
        let pat = SOLVERS.function(func).pattern(pattern);
        CandidateSet::new(
            func,
            pat,
            dtype,
            KernelExtraFlags::empty(),
            32 * 1024,
            256,
            64,
        )
    }

    #[test]
    fn every_enumerated_candidate_is_valid() {
        let set = set_for(BlasFunction::Gemm, 0, DataType::F32);
        assert!(!set.is_empty(), "the grid must contain valid candidates");

        for v in set.variants.iter() {
            let (dims, pgran) = set.decomposition(v);
            assert!(pgran.group_size() as usize == 64);
            assert!(pgran.is_valid());
            assert_eq!(dims[0].bwidth % dims[1].bwidth, 0);
            assert!(dims[0].x >= dims[1].x && dims[0].y >= dims[1].y);

            // Square-block pattern stays square.
            assert_eq!(dims[0].x, dims[0].y);
            assert_eq!(dims[0].x, dims[0].bwidth);

            // Register pressure bound.
            let l1 = dims[1];
            let regs = (l1.x * l1.bwidth + l1.y * l1.bwidth + l1.x * l1.y) * 4 / 16;
            assert!(regs <= 64);
        }
    }

    #[test]
    fn level2_candidates_collapse_x() {
        let set = set_for(BlasFunction::Gemv, 0, DataType::F32);
        assert!(!set.is_empty());
        for v in set.variants.iter().take(20) {
            let (dims, pgran) = set.decomposition(v);
            assert_eq!(dims[0].x, 1);
            assert_eq!(dims[1].x, 1);
            assert_eq!(pgran.wg_dim, 1);
        }
    }

    #[test]
    fn sequential_iteration_visits_every_candidate_once() {
        let mut set = set_for(BlasFunction::Gemm, 0, DataType::F32);
        set.return_all = true;
        let total = set.len();

        let mut visited = 1;
        while set.next(usize::MAX, 1.0 + visited as f64) {
            visited += 1;
        }
        assert_eq!(visited, total);
        assert!(set.best().is_some());
    }

    #[test]
    fn estimator_converges_to_the_best_candidate() {
        let mut set = set_for(BlasFunction::Gemm, 2, DataType::F32);
        assert!(set.len() > 4);
        set.return_all = false;

        // Synthetic cost driven by the outer tile only, so the (l0.x,
        // l0.y) pruning groups see it exactly.
        let cost = |v: &Variant| -> f64 { 10.0 - (v.ids[0] + v.ids[1]) as f64 };

        let budget = set.len();
        let mut measured = 1usize;
        loop {
            let t = cost(set.current());
            if !set.next(budget, t) {
                break;
            }
            measured += 1;
        }

        let (best, _) = set.best().unwrap();
        let best_possible = set
            .variants
            .iter()
            .map(|v| cost(v))
            .fold(f64::INFINITY, f64::min);
        assert!(
            (cost(best) - best_possible).abs() < 1e-9,
            "estimator missed the optimum with a full budget: {} vs {}",
            cost(best),
            best_possible
        );
        assert!(measured <= budget);
    }

    #[test]
    fn budget_bounds_the_search() {
        let mut set = set_for(BlasFunction::Gemm, 0, DataType::F32);
        set.return_all = false;
        let mut n = 1;
        while set.next(16, 1.0) {
            n += 1;
        }
        assert!(n <= 16);
    }
}
