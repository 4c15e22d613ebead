//! Basic usage example for `volume_store`.
//!
//! Allocates a pooled 16-bit volume the way a scan reader would after parsing a file header,
//! writes a sample into one slice and walks the slices with a cursor.
//!
//! Run with `RUST_LOG=volume_store=trace` to see the pool traffic.

use new_zealand::nz;
use tracing_subscriber::EnvFilter;
use volume_store::{BufferPool, SliceCursor, VolumeHandle};

fn main() -> volume_store::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let pool = BufferPool::builder()
        .block_capacity_for::<u16>(nz!(4), nz!(3))
        .buffer_count(nz!(5))
        .build()?;

    println!(
        "Created pool of {} blocks of {} bytes",
        pool.buffer_count(),
        pool.block_capacity()
    );

    // The element type usually comes from a file or message header.
    let mut volume = VolumeHandle::new();
    volume.allocate_tagged("uint16", 4, 3, 5, Some(&pool))?;

    println!(
        "Allocated {} volume of {}x{}x{}, {} blocks left in pool",
        volume.element_type()?,
        volume.width()?,
        volume.height()?,
        volume.depth()?,
        pool.available()
    );

    volume.as_stack_mut::<u16>()?.slice_mut(3)?.set(2, 1, 1000)?;

    let end = SliceCursor::end(&volume)?;
    let mut cursor = SliceCursor::begin(&volume)?;
    while cursor != end {
        let slice = cursor.current_slice::<u16>()?;
        let max = slice.as_slice().iter().copied().max().unwrap_or_default();
        println!("Slice {}: max sample {max}", cursor.index());

        cursor = cursor.advance();
    }

    drop(volume);

    let stats = pool.statistics();
    println!(
        "Volume dropped: {} of {} blocks available, peak usage {}",
        stats.available, stats.buffer_count, stats.peak_in_use
    );

    Ok(())
}
