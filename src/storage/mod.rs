//! Persistent tuning store: a binary file per device holding best-known
//! granulations and, optionally, compiled kernel binaries.
//!
//! The file mirrors the in-memory registry tree (Header, then Function,
//! Pattern, Extra and Param records), and every record offset is computed
//! up front from the registry shape, so the autotuner can rewrite a single
//! record in place. Kernel blobs are the only variable-size payload and
//! append at the file tail.

mod io;

use std::collections::HashMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use self::io::{seek_to, RecordReader, RecordWriter};
use crate::device::{DeviceDescriptor, DeviceIdent};
use crate::dims::{PGranularity, SubproblemDim, MAX_KERNELS_PER_STEP, MAX_SUBDIMS, SUBDIM_UNUSED};
use crate::error::{Error, Result};
use crate::flags::{is_valid_flag_combination, KernelExtraFlags};
use crate::pattern::SOLVERS;
use crate::types::{BlasFunction, DataType};
use crate::util;

pub const FILE_MAGIC: &[u8; 3] = b"CBS";
pub const FILE_VERSION: u32 = 3;
pub const FILE_EXT: &str = "kdb";
pub const ENV_STORAGE_PATH: &str = "CLBLAS_STORAGE_PATH";

/// On-disk stand-in for `SUBDIM_UNUSED`.
const SUBDIM_UNUSED_FILE_VALUE: u32 = 10_000;
/// Measured times above this are "no data yet".
const NO_DATA_TIME_LIMIT: f64 = 10_000.0;
/// Placeholder time of an untuned record.
pub const NO_DATA_TIME: f64 = 1e50;

/// Dimension buckets per (pattern, dtype, flags) combination.
pub const DIMENSION_COUNT: usize = 6;
/// Index of the dedicated bank-aligned bucket.
pub const BANK_ALIGNED_RECORD_IDX: usize = 5;

const HEADER_SIZE: u64 = 3 + 4 + 4 + 8 + 4;
const EXTRA_SIZE: u64 = 4 + 4 + 4 + 4;
const PARAM_SIZE: u64 =
    (5 * MAX_SUBDIMS as u64) * 4 + 5 * 4 + (MAX_KERNELS_PER_STEP as u64) * (8 + 4) + 8 + 4;

/// Outcome of a store lookup.
#[derive(Debug, PartialEq)]
pub enum Fetch<T> {
    Data(T),
    NoData,
    Corrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    NoLoad,
    CorrectData,
    IncorrectData,
}

/// One tuned decomposition for one problem-size bucket.
#[derive(Clone, Debug)]
pub struct ParamRecord {
    pub dim: u32,
    pub subdims: [SubproblemDim; MAX_SUBDIMS],
    pub pgran: PGranularity,
    pub kernel_offsets: [u64; MAX_KERNELS_PER_STEP],
    pub kernel_sizes: [u32; MAX_KERNELS_PER_STEP],
    pub time: f64,
    offset: u64,
    status: SyncStatus,
}

impl ParamRecord {
    fn new(dim: u32) -> ParamRecord {
        ParamRecord {
            dim,
            subdims: [SubproblemDim::default(); MAX_SUBDIMS],
            pgran: PGranularity::default(),
            kernel_offsets: [0; MAX_KERNELS_PER_STEP],
            kernel_sizes: [0; MAX_KERNELS_PER_STEP],
            time: NO_DATA_TIME,
            offset: 0,
            status: SyncStatus::NoLoad,
        }
    }

    pub fn has_data(&self) -> bool {
        self.status == SyncStatus::CorrectData && self.time <= NO_DATA_TIME_LIMIT
    }

    fn reset(&mut self) {
        self.subdims = [SubproblemDim::default(); MAX_SUBDIMS];
        self.pgran = PGranularity::default();
        self.kernel_offsets = [0; MAX_KERNELS_PER_STEP];
        self.kernel_sizes = [0; MAX_KERNELS_PER_STEP];
        self.time = NO_DATA_TIME;
    }

    /// Copies the tuned payload from another record, keeping this
    /// record's bucket dimension and file position.
    pub fn adopt(&mut self, other: &ParamRecord) {
        self.subdims = other.subdims;
        self.pgran = other.pgran;
        self.kernel_offsets = other.kernel_offsets;
        self.kernel_sizes = other.kernel_sizes;
        self.time = other.time;
    }
}

#[derive(Clone, Debug)]
pub struct ExtraRecord {
    pub dtype: DataType,
    pub flags: KernelExtraFlags,
    pub vec_len: u32,
    pub use_for_tuning: bool,
    pub params: Vec<ParamRecord>,
    offset: u64,
    status: SyncStatus,
}

#[derive(Clone, Debug)]
pub struct PatternRecord {
    pub name: &'static str,
    pub extras: Vec<ExtraRecord>,
    offset: u64,
    status: SyncStatus,
}

impl PatternRecord {
    fn record_size(&self) -> u64 {
        4 + (self.name.len() as u64 + 1) + 4 + 4
    }
}

#[derive(Clone, Debug)]
pub struct FunctionRecord {
    pub func: BlasFunction,
    pub patterns: Vec<PatternRecord>,
}

/// Index path of one param record inside a cache tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamPath {
    pub func: usize,
    pub pattern: usize,
    pub extra: usize,
    pub param: usize,
}

/// The per-device store: registry-shaped tree plus the backing file.
#[derive(Clone, Debug)]
pub struct StorageCache {
    pub ident: DeviceIdent,
    pub device_name: String,
    path: Option<PathBuf>,
    tmp_path: Option<PathBuf>,
    pub populated: bool,
    pub functions: Vec<FunctionRecord>,
    end_file: u64,
}

/// Directory holding the `.kdb` files, from `CLBLAS_STORAGE_PATH`.
pub fn storage_dir() -> Option<PathBuf> {
    env::var_os(ENV_STORAGE_PATH).map(PathBuf::from)
}

fn enumerate_extras(
    func: BlasFunction,
    desc: &DeviceDescriptor,
) -> Vec<ExtraRecord> {
    let solvers = SOLVERS.function(func);
    let unique = solvers.mask_for_unique_kernels.bits();
    let tuning = solvers.mask_for_tunings_kernel.bits();

    let mut dtypes = Vec::new();
    for &dt in &[DataType::F32, DataType::C32, DataType::F64, DataType::C64] {
        if desc.supports_dtype(dt) {
            dtypes.push(dt);
        }
    }

    let mut extras = Vec::new();
    let mut bits: u64 = 0;
    while bits <= unique as u64 {
        let m = bits as u32 & !unique;
        if m != 0 {
            // Jump over the whole range sharing the stray bit.
            let low = m & m.wrapping_neg();
            bits += low as u64;
            continue;
        }
        let flags = KernelExtraFlags::from_bits_truncate(bits as u32);
        for &dtype in &dtypes {
            if !is_valid_flag_combination(dtype, flags) {
                continue;
            }
            let mut params = Vec::with_capacity(DIMENSION_COUNT);
            for idx in 0..DIMENSION_COUNT {
                params.push(ParamRecord::new(get_dimension(idx, dtype, desc, func)));
            }
            extras.push(ExtraRecord {
                dtype,
                flags,
                vec_len: if dtype.is_complex() { 2 } else { 4 },
                use_for_tuning: bits as u32 & !tuning == 0,
                params,
                offset: 0,
                status: SyncStatus::NoLoad,
            });
        }
        bits += 1;
    }

    extras
}

/// Base dimensions for level-3 and level-2 buckets. The last entry of
/// each is the bank-aligned case.
const DIMENSIONS_L3: [u32; DIMENSION_COUNT] = [7, 13, 32, 48, 64, 64];
const DIMENSIONS_L2: [u32; DIMENSION_COUNT] = [192, 448, 832, 1312, 1696, 768];

/// Problem edge length tuned for one bucket. The bank-aligned bucket is
/// forced onto the 2048-byte channel boundary; every other bucket is
/// nudged off it.
pub fn get_dimension(
    idx: usize,
    dtype: DataType,
    desc: &DeviceDescriptor,
    func: BlasFunction,
) -> u32 {
    // banks * channels * bytes per channel
    let bas: usize = 8 * 256;
    let tsize = dtype.size();
    let no_tail_step = 256 * 4 / tsize;
    let level2 = func.blas_level() == 2;

    let mut step = desc.compute_units.min(if level2 { 1 } else { 24 }) as f64;
    step *= match dtype {
        DataType::F32 => 4.0,
        DataType::F64 | DataType::C32 => 2.8,
        DataType::C64 => 2.0,
    };

    let base = if level2 {
        DIMENSIONS_L2[idx]
    } else {
        DIMENSIONS_L3[idx]
    };
    let mut dim = (step * base as f64) as usize;

    if dim * dim * tsize > desc.max_mem_alloc_size as usize {
        dim = ((desc.max_mem_alloc_size as usize / tsize) as f64).sqrt() as usize;
    }
    if desc.global_mem_size > 0 && dim * dim * tsize >= desc.global_mem_size as usize / 3 {
        dim = ((desc.global_mem_size as usize / 3 / tsize) as f64).sqrt() as usize;
    }

    dim = util::round_up(dim.saturating_sub(no_tail_step / 2).max(1), no_tail_step);
    if idx == BANK_ALIGNED_RECORD_IDX {
        if dim * tsize % bas != 0 {
            dim = util::round_up(dim, bas / tsize);
        }
    } else if dim * tsize % bas == 0 {
        dim += no_tail_step;
    }

    dim as u32
}

impl StorageCache {
    /// Builds the registry-shaped tree for a device, locating the backing
    /// file under `CLBLAS_STORAGE_PATH`.
    pub fn for_device(desc: &DeviceDescriptor) -> StorageCache {
        Self::for_device_in_dir(desc, storage_dir().as_deref())
    }

    /// Same, with an explicit directory (tests and the tuner use this).
    pub fn for_device_in_dir(desc: &DeviceDescriptor, dir: Option<&Path>) -> StorageCache {
        let mut functions = Vec::with_capacity(BlasFunction::all().len());
        for &func in BlasFunction::all().iter() {
            let solvers = SOLVERS.function(func);
            let patterns = solvers
                .patterns()
                .iter()
                .map(|pat| PatternRecord {
                    name: pat.name,
                    extras: enumerate_extras(func, desc),
                    offset: 0,
                    status: SyncStatus::NoLoad,
                })
                .collect();
            functions.push(FunctionRecord { func, patterns });
        }

        let path = dir.map(|d| d.join(format!("{}.{}", desc.name, FILE_EXT)));
        let tmp_path = dir.map(|d| d.join(format!("{}.{}.tmp", desc.name, FILE_EXT)));

        let mut cache = StorageCache {
            ident: desc.ident,
            device_name: desc.name.clone(),
            path,
            tmp_path,
            populated: false,
            functions,
            end_file: 0,
        };
        cache.calc_offsets();
        cache
    }

    /// Precomputes every record offset; kernel blobs start at `end_file`.
    fn calc_offsets(&mut self) {
        let mut pos = HEADER_SIZE;
        for func in &mut self.functions {
            for patt in &mut func.patterns {
                patt.offset = pos;
                pos += patt.record_size();
                for extra in &mut patt.extras {
                    extra.offset = pos;
                    pos += EXTRA_SIZE;
                    for param in &mut extra.params {
                        param.offset = pos;
                        pos += PARAM_SIZE;
                    }
                }
            }
        }
        self.end_file = pos;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the store file into the tree. A missing file, version skew or
    /// a bad header leaves the cache unpopulated; individual damaged
    /// records degrade to "no data".
    pub fn load(&mut self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };

        let mut reader = RecordReader::new(&mut file);
        let mut magic = [0u8; 3];
        reader.read_bytes(&mut magic)?;
        let version = reader.read_u32()?;
        let _nr_functions = reader.read_u32()?;
        let _bin_start = reader.read_u64()?;
        let header_ok = reader.finish()?;
        if !header_ok || &magic != FILE_MAGIC || version != FILE_VERSION {
            log::warn!(
                "tuning store {:?}: header mismatch (version {}), ignoring",
                path,
                version
            );
            return Ok(());
        }

        for func in &mut self.functions {
            for patt in &mut func.patterns {
                seek_to(&mut file, patt.offset)?;
                let mut reader = RecordReader::new(&mut file);
                let name_len = reader.read_u32()? as usize;
                if name_len == 0 || name_len > 256 {
                    continue;
                }
                let mut name = vec![0u8; name_len];
                reader.read_bytes(&mut name)?;
                let nr_extras = reader.read_u32()?;
                if !reader.finish()? {
                    continue;
                }
                if &name[..name_len - 1] != patt.name.as_bytes() {
                    continue;
                }
                patt.status = SyncStatus::CorrectData;
                let _ = nr_extras;

                for extra in &mut patt.extras {
                    seek_to(&mut file, extra.offset)?;
                    let mut reader = RecordReader::new(&mut file);
                    let dtype = reader.read_u32()?;
                    let flags = reader.read_u32()?;
                    let nr_params = reader.read_u32()? as usize;
                    if !reader.finish()? {
                        continue;
                    }
                    if dtype != extra.dtype.index() as u32
                        || flags != extra.flags.bits()
                        || nr_params != extra.params.len()
                    {
                        continue;
                    }
                    extra.status = SyncStatus::CorrectData;
                    for param in &mut extra.params {
                        load_param(&mut file, param)?;
                    }
                }
            }
        }

        self.populated = true;
        Ok(())
    }

    /// Writes the whole tree to the temporary file and atomically renames
    /// it over the store. Kernel blobs are not carried over.
    pub fn write_full(&mut self) -> Result<()> {
        let (path, tmp) = match (&self.path, &self.tmp_path) {
            (Some(p), Some(t)) => (p.clone(), t.clone()),
            _ => return Err(Error::invalid("no storage path configured")),
        };
        self.calc_offsets();

        let mut file = File::create(&tmp)?;
        let mut writer = RecordWriter::new(&mut file);
        writer.write_bytes(FILE_MAGIC)?;
        writer.write_u32(FILE_VERSION)?;
        writer.write_u32(self.functions.len() as u32)?;
        writer.write_u64(self.end_file)?;
        writer.finish()?;

        for func in &self.functions {
            for patt in &func.patterns {
                seek_to(&mut file, patt.offset)?;
                let mut writer = RecordWriter::new(&mut file);
                writer.write_u32(patt.name.len() as u32 + 1)?;
                writer.write_bytes(patt.name.as_bytes())?;
                writer.write_bytes(&[0])?;
                writer.write_u32(patt.extras.len() as u32)?;
                writer.finish()?;

                for extra in &patt.extras {
                    seek_to(&mut file, extra.offset)?;
                    let mut writer = RecordWriter::new(&mut file);
                    writer.write_u32(extra.dtype.index() as u32)?;
                    writer.write_u32(extra.flags.bits())?;
                    writer.write_u32(extra.params.len() as u32)?;
                    writer.finish()?;

                    for param in &extra.params {
                        seek_to(&mut file, param.offset)?;
                        write_param(&mut file, param)?;
                    }
                }
            }
        }
        file.sync_all()?;
        drop(file);

        let _ = std::fs::remove_file(&path);
        std::fs::rename(&tmp, &path)?;
        self.populated = true;
        Ok(())
    }

    /// Creates the store file if it does not exist yet.
    pub fn ensure_file(&mut self) -> Result<()> {
        let exists = match &self.path {
            Some(p) => p.exists(),
            None => {
                return Err(Error::invalid(format!("{} is not set", ENV_STORAGE_PATH)))
            }
        };
        if exists {
            self.load()
        } else {
            self.write_full()
        }
    }

    pub fn param(&self, path: ParamPath) -> &ParamRecord {
        &self.functions[path.func].patterns[path.pattern].extras[path.extra].params[path.param]
    }

    pub fn param_mut(&mut self, path: ParamPath) -> &mut ParamRecord {
        &mut self.functions[path.func].patterns[path.pattern].extras[path.extra].params
            [path.param]
    }

    pub fn extra(&self, path: ParamPath) -> &ExtraRecord {
        &self.functions[path.func].patterns[path.pattern].extras[path.extra]
    }

    /// Finds the record for a pattern/type/flags triple, picking the
    /// bucket closest to `dim`. `dim == 0` selects the dedicated
    /// bank-aligned bucket, which no other lookup ever returns.
    pub fn find_param(
        &self,
        patt_name: &str,
        dtype: DataType,
        kflags: KernelExtraFlags,
        dim: usize,
    ) -> Option<ParamPath> {
        for (fi, func) in self.functions.iter().enumerate() {
            let mask = SOLVERS.function(func.func).mask_for_tunings_kernel;
            for (pi, patt) in func.patterns.iter().enumerate() {
                if patt.name != patt_name {
                    continue;
                }
                let masked = kflags & mask;
                for (ei, extra) in patt.extras.iter().enumerate() {
                    if extra.dtype != dtype || extra.flags != masked {
                        continue;
                    }
                    if dim == 0 {
                        return Some(ParamPath {
                            func: fi,
                            pattern: pi,
                            extra: ei,
                            param: BANK_ALIGNED_RECORD_IDX,
                        });
                    }
                    let mut best = None;
                    let mut best_delta = u32::MAX;
                    for (qi, param) in extra.params.iter().enumerate() {
                        if qi == BANK_ALIGNED_RECORD_IDX {
                            continue;
                        }
                        let delta = (dim as i64 - param.dim as i64).unsigned_abs() as u32;
                        if delta < best_delta {
                            best_delta = delta;
                            best = Some(qi);
                        }
                    }
                    return best.map(|qi| ParamPath {
                        func: fi,
                        pattern: pi,
                        extra: ei,
                        param: qi,
                    });
                }
            }
        }
        None
    }

    /// Compares the record-tree layout of two caches for the same device.
    /// The tuner runs this after a full rewrite to confirm the file still
    /// matches the registry shape.
    pub fn layout_matches(&self, other: &StorageCache) -> bool {
        self.functions.len() == other.functions.len()
            && self.functions.iter().zip(&other.functions).all(|(a, b)| {
                a.func == b.func
                    && a.patterns.len() == b.patterns.len()
                    && a.patterns.iter().zip(&b.patterns).all(|(p, q)| {
                        p.name == q.name
                            && p.extras.len() == q.extras.len()
                            && p.extras.iter().zip(&q.extras).all(|(e, f)| {
                                e.dtype == f.dtype
                                    && e.flags == f.flags
                                    && e.params.len() == f.params.len()
                            })
                    })
            })
    }

    /// Rewrites one param record in place (autotuner writeback).
    pub fn save_best_param(&mut self, path: ParamPath) -> Result<()> {
        let file_path = self
            .path
            .clone()
            .ok_or_else(|| Error::invalid("no storage path configured"))?;
        let mut file = OpenOptions::new().read(true).write(true).open(&file_path)?;
        {
            let param = self.param(path);
            seek_to(&mut file, param.offset)?;
            write_param(&mut file, param)?;
        }
        file.sync_all()?;
        self.param_mut(path).status = SyncStatus::CorrectData;
        Ok(())
    }

    /// Appends kernel binaries at the file tail and records their offsets
    /// in the param record.
    pub fn save_kernels(
        &mut self,
        path: ParamPath,
        blobs: &[Option<Vec<u8>>; MAX_KERNELS_PER_STEP],
    ) -> Result<()> {
        let file_path = self
            .path
            .clone()
            .ok_or_else(|| Error::invalid("no storage path configured"))?;
        let mut file = OpenOptions::new().read(true).write(true).open(&file_path)?;

        let mut end = self.end_file;
        {
            let param = self.param_mut(path);
            for (k, blob) in blobs.iter().enumerate() {
                let blob = match blob {
                    Some(b) if !b.is_empty() => b,
                    _ => {
                        param.kernel_offsets[k] = 0;
                        param.kernel_sizes[k] = 0;
                        continue;
                    }
                };
                seek_to(&mut file, end)?;
                let mut writer = RecordWriter::new(&mut file);
                writer.write_u32(blob.len() as u32)?;
                writer.write_bytes(blob)?;
                writer.finish()?;
                param.kernel_offsets[k] = end;
                param.kernel_sizes[k] = blob.len() as u32;
                end += 4 + blob.len() as u64 + 4;
            }
        }
        self.end_file = end;
        drop(file);

        self.save_best_param(path)
    }

    /// Loads the kernel binaries referenced by a param record.
    pub fn load_kernels(
        &self,
        path: ParamPath,
    ) -> Result<[Option<Vec<u8>>; MAX_KERNELS_PER_STEP]> {
        let mut out: [Option<Vec<u8>>; MAX_KERNELS_PER_STEP] = [None, None, None];
        let file_path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(out),
        };
        let mut file = File::open(&file_path)?;
        let param = self.param(path);

        for k in 0..MAX_KERNELS_PER_STEP {
            if param.kernel_sizes[k] == 0 || param.kernel_offsets[k] == 0 {
                continue;
            }
            seek_to(&mut file, param.kernel_offsets[k])?;
            let mut reader = RecordReader::new(&mut file);
            let size = reader.read_u32()? as usize;
            if size != param.kernel_sizes[k] as usize {
                continue;
            }
            let mut blob = vec![0u8; size];
            reader.read_bytes(&mut blob)?;
            if reader.finish()? {
                out[k] = Some(blob);
            }
        }
        Ok(out)
    }
}

fn load_param(file: &mut File, param: &mut ParamRecord) -> Result<()> {
    seek_to(file, param.offset)?;
    let mut reader = RecordReader::new(file);

    let mut subdims = [SubproblemDim::default(); MAX_SUBDIMS];
    for d in subdims.iter_mut() {
        d.x = reader.read_u32()? as usize;
        d.y = reader.read_u32()? as usize;
        let item_x = reader.read_u32()?;
        d.item_x = if item_x >= SUBDIM_UNUSED_FILE_VALUE {
            SUBDIM_UNUSED
        } else {
            item_x as usize
        };
        let item_y = reader.read_u32()?;
        d.item_y = if item_y >= SUBDIM_UNUSED_FILE_VALUE {
            SUBDIM_UNUSED
        } else {
            item_y as usize
        };
        d.bwidth = reader.read_u32()? as usize;
    }

    let pgran = PGranularity {
        wg_dim: reader.read_u32()?,
        wg_size: [reader.read_u32()?, reader.read_u32()?],
        wf_size: reader.read_u32()?,
        max_work_group_size: reader.read_u32()?,
    };

    let mut kernel_offsets = [0u64; MAX_KERNELS_PER_STEP];
    for o in kernel_offsets.iter_mut() {
        *o = reader.read_u64()?;
    }
    let mut kernel_sizes = [0u32; MAX_KERNELS_PER_STEP];
    for s in kernel_sizes.iter_mut() {
        *s = reader.read_u32()?;
    }
    let time = reader.read_f64()?;

    let dim_exists = subdims[0].y != 0;
    let crc_ok = reader.finish()?;

    if crc_ok && dim_exists && time <= NO_DATA_TIME_LIMIT {
        param.subdims = subdims;
        param.pgran = pgran;
        param.kernel_offsets = kernel_offsets;
        param.kernel_sizes = kernel_sizes;
        param.time = time;
        param.status = SyncStatus::CorrectData;
    } else if !crc_ok && dim_exists {
        // Damaged payload: degrade to defaults rather than trusting it.
        param.reset();
        param.status = SyncStatus::IncorrectData;
        log::warn!("tuning store: param record at {} failed CRC", param.offset);
    } else {
        param.reset();
        param.status = SyncStatus::NoLoad;
    }
    Ok(())
}

fn write_param(file: &mut File, param: &ParamRecord) -> Result<()> {
    let mut writer = RecordWriter::new(file);
    for d in param.subdims.iter() {
        writer.write_u32(d.x as u32)?;
        writer.write_u32(d.y as u32)?;
        writer.write_u32(if d.item_x == SUBDIM_UNUSED {
            SUBDIM_UNUSED_FILE_VALUE
        } else {
            d.item_x as u32
        })?;
        writer.write_u32(if d.item_y == SUBDIM_UNUSED {
            SUBDIM_UNUSED_FILE_VALUE
        } else {
            d.item_y as u32
        })?;
        writer.write_u32(d.bwidth as u32)?;
    }
    writer.write_u32(param.pgran.wg_dim)?;
    writer.write_u32(param.pgran.wg_size[0])?;
    writer.write_u32(param.pgran.wg_size[1])?;
    writer.write_u32(param.pgran.wf_size)?;
    writer.write_u32(param.pgran.max_work_group_size)?;
    for o in param.kernel_offsets.iter() {
        writer.write_u64(*o)?;
    }
    for s in param.kernel_sizes.iter() {
        writer.write_u32(*s)?;
    }
    writer.write_f64(param.time)?;
    writer.finish()?;
    Ok(())
}

lazy_static! {
    static ref STORAGE_CACHES: Mutex<HashMap<DeviceIdent, Arc<StorageCache>>> =
        Mutex::new(HashMap::new());
}

/// Returns the loaded store for a device, reading the file on first use.
/// Without `force`, an unpopulated store (no file on disk) yields `None`
/// and callers fall back to defaults.
pub fn get_storage_cache(desc: &DeviceDescriptor, force: bool) -> Option<Arc<StorageCache>> {
    let mut caches = STORAGE_CACHES.lock().unwrap();
    let entry = caches.entry(desc.ident).or_insert_with(|| {
        let mut cache = StorageCache::for_device(desc);
        if let Err(err) = cache.load() {
            log::warn!("tuning store load failed for {}: {}", desc.name, err);
        }
        Arc::new(cache)
    });
    if entry.populated || force {
        Some(Arc::clone(entry))
    } else {
        None
    }
}

/// Drops the process-wide store caches; the next lookup re-reads the
/// files. The autotuner calls this after a full rewrite.
pub fn invalidate_storage_caches() {
    STORAGE_CACHES.lock().unwrap().clear();
}

/// Storage lookup for a granulation record.
pub fn get_granularity_info(
    desc: &DeviceDescriptor,
    patt_name: &str,
    dtype: DataType,
    kflags: KernelExtraFlags,
    dim: usize,
) -> Fetch<([SubproblemDim; MAX_SUBDIMS], PGranularity, f64)> {
    let cache = match get_storage_cache(desc, false) {
        Some(c) => c,
        None => return Fetch::NoData,
    };
    match cache.find_param(patt_name, dtype, kflags, dim) {
        Some(path) => {
            let param = cache.param(path);
            match param.status {
                SyncStatus::CorrectData if param.has_data() => {
                    Fetch::Data((param.subdims, param.pgran, param.time))
                }
                SyncStatus::IncorrectData => Fetch::Corrupt,
                _ => Fetch::NoData,
            }
        }
        None => Fetch::NoData,
    }
}

/// Storage lookup for the compiled kernels of a record.
pub fn get_kernel_info(
    desc: &DeviceDescriptor,
    patt_name: &str,
    dtype: DataType,
    kflags: KernelExtraFlags,
    dim: usize,
) -> Fetch<[Option<Vec<u8>>; MAX_KERNELS_PER_STEP]> {
    let cache = match get_storage_cache(desc, false) {
        Some(c) => c,
        None => return Fetch::NoData,
    };
    match cache.find_param(patt_name, dtype, kflags, dim) {
        Some(path) if cache.param(path).has_data() => match cache.load_kernels(path) {
            Ok(blobs) if blobs.iter().any(|b| b.is_some()) => Fetch::Data(blobs),
            Ok(_) => Fetch::NoData,
            Err(_) => Fetch::Corrupt,
        },
        _ => Fetch::NoData,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::DeviceIdent;

    pub(crate) fn synthetic_device() -> DeviceDescriptor {
        DeviceDescriptor {
            ident: DeviceIdent::default(),
            name: "TestDevice".into(),
            compute_units: 32,
            lds_size: 32 * 1024,
            max_work_group_size: 256,
            address_bits: 64,
            wavefront: 64,
            native_double: true,
            native_complex: true,
            image_support: true,
            alignment: 128,
            max_mem_alloc_size: 512 * 1024 * 1024,
            global_mem_size: 2 * 1024 * 1024 * 1024u64,
            image2d_max_width: 8192,
            image2d_max_height: 8192,
        }
    }

    #[test]
    fn offsets_are_disjoint_and_ordered() {
        let desc = synthetic_device();
        let cache = StorageCache::for_device_in_dir(&desc, None);
        let mut last = HEADER_SIZE;
        for func in &cache.functions {
            for patt in &func.patterns {
                assert!(patt.offset >= last);
                last = patt.offset + patt.record_size();
                for extra in &patt.extras {
                    assert_eq!(extra.offset, last);
                    last += EXTRA_SIZE;
                    for param in &extra.params {
                        assert_eq!(param.offset, last);
                        last += PARAM_SIZE;
                    }
                }
            }
        }
        assert_eq!(cache.end_file, last);
    }

    #[test]
    fn extras_respect_the_unique_mask() {
        let desc = synthetic_device();
        let cache = StorageCache::for_device_in_dir(&desc, None);
        let gemm = &cache.functions[BlasFunction::Gemm.index()];
        let unique = SOLVERS
            .function(BlasFunction::Gemm)
            .mask_for_unique_kernels;
        for extra in &gemm.patterns[0].extras {
            assert_eq!(extra.flags & !unique, KernelExtraFlags::empty());
            assert_eq!(extra.params.len(), DIMENSION_COUNT);
        }
        // CONJ_A without TRANS_A must have been filtered out.
        assert!(gemm.patterns[0]
            .extras
            .iter()
            .all(|e| !e.flags.contains(KernelExtraFlags::CONJ_A)
                || e.flags.contains(KernelExtraFlags::TRANS_A)));
    }

    #[test]
    fn bank_aligned_bucket_is_reserved() {
        let desc = synthetic_device();
        let dim = get_dimension(BANK_ALIGNED_RECORD_IDX, DataType::F32, &desc, BlasFunction::Gemm);
        assert_eq!(dim as usize * 4 % 2048, 0);
        for idx in 0..BANK_ALIGNED_RECORD_IDX {
            let dim = get_dimension(idx, DataType::F32, &desc, BlasFunction::Gemm);
            assert_ne!(dim as usize * 4 % 2048, 0, "bucket {} landed on a bank", idx);
        }
    }

    #[test]
    fn round_trip_and_corruption() {
        let desc = synthetic_device();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StorageCache::for_device_in_dir(&desc, Some(dir.path()));

        // Tune one record and persist everything.
        let path = cache
            .find_param("BufferGemm", DataType::F32, KernelExtraFlags::empty(), 1000)
            .unwrap();
        {
            let param = cache.param_mut(path);
            param.subdims[0] = SubproblemDim {
                x: 32,
                y: 32,
                bwidth: 32,
                item_x: 32,
                item_y: 32,
            };
            param.subdims[1] = SubproblemDim {
                x: 4,
                y: 4,
                bwidth: 4,
                item_x: 4,
                item_y: SUBDIM_UNUSED,
            };
            param.pgran = PGranularity {
                wg_dim: 2,
                wg_size: [8, 8],
                wf_size: 64,
                max_work_group_size: 256,
            };
            param.time = 1.25;
        }
        cache.write_full().unwrap();

        // A fresh cache reads the record back identically.
        let mut fresh = StorageCache::for_device_in_dir(&desc, Some(dir.path()));
        fresh.load().unwrap();
        assert!(fresh.populated);
        let got = fresh.param(path);
        let want = cache.param(path);
        assert_eq!(got.subdims, want.subdims);
        assert_eq!(got.pgran, want.pgran);
        assert_eq!(got.time, want.time);
        assert_eq!(got.subdims[1].item_y, SUBDIM_UNUSED);
        assert!(got.has_data());
        let want_offset = want.offset;

        // In-place writeback of a single record.
        {
            let param = cache.param_mut(path);
            param.time = 0.5;
        }
        cache.save_best_param(path).unwrap();
        let mut fresh = StorageCache::for_device_in_dir(&desc, Some(dir.path()));
        fresh.load().unwrap();
        assert_eq!(fresh.param(path).time, 0.5);

        // Flip one byte inside the tuned record: reads as no data.
        let file_path = cache.path().unwrap().to_path_buf();
        let mut data = std::fs::read(&file_path).unwrap();
        let off = want_offset as usize + 4;
        data[off] ^= 0xFF;
        std::fs::write(&file_path, &data).unwrap();

        let mut damaged = StorageCache::for_device_in_dir(&desc, Some(dir.path()));
        damaged.load().unwrap();
        assert!(!damaged.param(path).has_data());
    }

    #[test]
    fn kernel_blob_round_trip() {
        let desc = synthetic_device();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StorageCache::for_device_in_dir(&desc, Some(dir.path()));
        cache.write_full().unwrap();

        let path = cache
            .find_param("CachedGemm", DataType::F32, KernelExtraFlags::empty(), 500)
            .unwrap();
        {
            let param = cache.param_mut(path);
            param.subdims[0].y = 32;
            param.time = 2.0;
        }
        let blobs = [Some(vec![1u8, 2, 3, 4, 5]), None, Some(vec![9u8; 100])];
        cache.save_kernels(path, &blobs).unwrap();

        let loaded = cache.load_kernels(path).unwrap();
        assert_eq!(loaded[0].as_deref(), Some(&[1u8, 2, 3, 4, 5][..]));
        assert!(loaded[1].is_none());
        assert_eq!(loaded[2].as_deref(), Some(&[9u8; 100][..]));
    }

    #[test]
    fn layouts_of_equal_devices_match() {
        let desc = synthetic_device();
        let a = StorageCache::for_device_in_dir(&desc, None);
        let b = StorageCache::for_device_in_dir(&desc, None);
        assert!(a.layout_matches(&b));

        let mut poor = synthetic_device();
        poor.native_double = false;
        let c = StorageCache::for_device_in_dir(&poor, None);
        assert!(!a.layout_matches(&c));
    }

    #[test]
    fn bank_aligned_lookup_only_for_zero_dim() {
        let desc = synthetic_device();
        let cache = StorageCache::for_device_in_dir(&desc, None);
        let p0 = cache
            .find_param("BufferGemm", DataType::F32, KernelExtraFlags::empty(), 0)
            .unwrap();
        assert_eq!(p0.param, BANK_ALIGNED_RECORD_IDX);
        let p = cache
            .find_param("BufferGemm", DataType::F32, KernelExtraFlags::empty(), 4096)
            .unwrap();
        assert_ne!(p.param, BANK_ALIGNED_RECORD_IDX);
    }
}
