//! Smoke tests against the first available OpenCL device. Each test
//! returns early when the platform has no device, so headless runners
//! stay green.

use ocl::{Context, Device, Platform, Queue};

use crate::kargs::ProblemArgs;
use crate::solution::make_solution_seq;
use crate::types::{BlasFunction, DataType, Multiplier};

fn default_queue() -> Option<Queue> {
    let platform = Platform::list().into_iter().next()?;
    let device = Device::list_all(platform).ok()?.into_iter().next()?;
    let context = Context::builder()
        .platform(platform)
        .devices(device)
        .build()
        .ok()?;
    Queue::new(&context, device, None).ok()
}

fn buffer(queue: &Queue, elems: usize) -> ocl::core::Mem {
    unsafe {
        ocl::core::create_buffer::<_, f32>(
            queue.context().as_core(),
            ocl::flags::MEM_READ_WRITE,
            elems,
            None,
        )
        .expect("buffer alloc")
    }
}

#[test]
fn gemm_solution_builds_and_runs() {
    let queue = match default_queue() {
        Some(q) => q,
        None => return,
    };

    let n = 256usize;
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = n;
    args.n = n;
    args.k = n;
    args.lda = n;
    args.ldb = n;
    args.ldc = n;
    args.alpha = Multiplier::one();
    args.beta = Multiplier::default();
    args.a = Some(buffer(&queue, n * n));
    args.b = Some(buffer(&queue, n * n));
    args.c = Some(buffer(&queue, n * n));

    let queues = vec![queue.clone()];
    let mut seq = make_solution_seq(BlasFunction::Gemm, &args, &queues)
        .expect("solution sequence");
    assert_eq!(seq.steps.iter().filter(|s| s.queue.is_some()).count(), 1);
    assert!(seq.steps[0].kernels[0].is_some());

    let events = seq.enqueue(&queues, &[]).expect("enqueue");
    assert_eq!(events.len(), 1);
    queue.finish().expect("finish");
}

#[test]
fn gemv_solution_builds_and_runs() {
    let queue = match default_queue() {
        Some(q) => q,
        None => return,
    };

    let (m, n) = (512usize, 256usize);
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = m;
    args.n = n;
    args.lda = n;
    args.ldb = 1;
    args.ldc = 1;
    args.a = Some(buffer(&queue, m * n));
    args.b = Some(buffer(&queue, n));
    args.c = Some(buffer(&queue, m));

    let queues = vec![queue.clone()];
    let mut seq =
        make_solution_seq(BlasFunction::Gemv, &args, &queues).expect("solution sequence");
    let events = seq.enqueue(&queues, &[]).expect("enqueue");
    assert!(!events.is_empty());
    queue.finish().expect("finish");
}
