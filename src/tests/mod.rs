//! Cross-module scenario tests: whole-pipeline shapes the per-module unit
//! tests do not cover. Anything needing a live OpenCL device skips itself
//! when none is present.

mod device_smoke;
mod solution_shapes;
mod storage_tuning;
