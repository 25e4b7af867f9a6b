//! Process-wide pool of scratch images for patterns that stage operands
//! through the image cache path.
//!
//! Two images exist per (context, device) pair and are handed out under a
//! mutex. Acquiring scratch from an out-of-order queue is forbidden
//! upstream by giving such queues a zero image budget.

use std::sync::Mutex;

use lazy_static::lazy_static;

use ocl::core::Mem;
use ocl::enums::{ImageChannelDataType, ImageChannelOrder, MemObjectType};
use ocl::prm::Float4;
use ocl::{Context, Device, Image, MemFlags};

use crate::solution::SolutionStep;

const IMAGES_PER_PAIR: usize = 2;

struct ScratchImage {
    context_ptr: usize,
    device: Device,
    image: Image<Float4>,
    width: usize,
    height: usize,
    in_use: bool,
}

lazy_static! {
    static ref POOL: Mutex<Vec<ScratchImage>> = Mutex::new(Vec::new());
}

fn context_ptr(context: &Context) -> usize {
    context.as_core().as_ptr() as usize
}

fn create_image(
    context: &Context,
    best_size: usize,
    min_size: usize,
    min_width: usize,
) -> Option<(Image<Float4>, usize, usize)> {
    let width = min_width.max(1);
    let min_height = (min_size / width).max(1);
    let mut height = (best_size / width).max(min_height);

    // Only allocation failures drive the retry; device limits are folded
    // into the requested sizes by the caller.
    loop {
        let result = Image::<Float4>::builder()
            .context(context)
            .channel_order(ImageChannelOrder::Rgba)
            .channel_data_type(ImageChannelDataType::Float)
            .image_type(MemObjectType::Image2d)
            .dims((width, height))
            .flags(MemFlags::new().read_write())
            .build();
        match result {
            Ok(image) => return Some((image, width, height)),
            Err(_) if height > min_height => {
                height = (height / 2).max(min_height);
            }
            Err(_) => return None,
        }
    }
}

/// Acquires a scratch image of at least `min_size` float4 texels and
/// `min_width` texels per row, preferring `best_size`.
pub fn get_sc_image(
    context: &Context,
    device: &Device,
    best_size: usize,
    min_size: usize,
    min_width: usize,
) -> Option<Mem> {
    let mut pool = POOL.lock().unwrap();
    let cptr = context_ptr(context);

    // Reuse a free image that is big enough.
    for entry in pool.iter_mut() {
        if !entry.in_use
            && entry.context_ptr == cptr
            && entry.device == *device
            && entry.width >= min_width
            && entry.width * entry.height >= min_size
        {
            entry.in_use = true;
            return Some(entry.image.as_core().clone());
        }
    }

    let existing = pool
        .iter()
        .filter(|e| e.context_ptr == cptr && e.device == *device)
        .count();
    if existing >= IMAGES_PER_PAIR {
        return None;
    }

    let (image, width, height) = create_image(context, best_size, min_size, min_width)?;
    let mem = image.as_core().clone();
    pool.push(ScratchImage {
        context_ptr: cptr,
        device: *device,
        image,
        width,
        height,
        in_use: true,
    });
    Some(mem)
}

/// Returns one image to the pool.
pub fn release_image(mem: &Mem) {
    let mut pool = POOL.lock().unwrap();
    for entry in pool.iter_mut() {
        if entry.image.as_core().as_ptr() == mem.as_ptr() {
            entry.in_use = false;
        }
    }
}

/// Releases every scratch image a step holds.
pub fn release_step_images(step: &mut SolutionStep) {
    for slot in step.args.scimage.iter_mut() {
        if let Some(mem) = slot.take() {
            release_image(&mem);
        }
    }
}
