//! Byte-granular copies into, out of and between views
//!
//! Each helper pins the page span it touches, faults the pages in one by
//! one and moves the bytes through the direct map. Destinations are marked
//! dirty once the copy succeeded.

use alloc::vec;

use nos_vm_api::{page_offset, page_round_down, page_round_up, Error, PageAccessor, Result, PAGE_SIZE};

use super::{FetchFlags, MemoryView};

fn span(offset: usize, size: usize) -> (usize, usize) {
    let base = page_round_down(offset);
    (base, page_round_up(offset + size) - base)
}

/// Copies `data` into `view` at `offset`
pub async fn copy_to_view(view: &dyn MemoryView, offset: usize, data: &[u8], memory: &dyn PageAccessor) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let (base, length) = span(offset, data.len());
    view.async_lock_range(base, length).await?;

    let copied = async {
        let mut progress = 0;
        while progress < data.len() {
            let address = offset + progress;
            let chunk = core::cmp::min(PAGE_SIZE - page_offset(address), data.len() - progress);
            let range = view.fetch_range(address, FetchFlags::WRITE).await?;
            memory.write(range.physical, &data[progress..progress + chunk]);
            progress += chunk;
        }
        Ok::<(), Error>(())
    }
    .await;

    if copied.is_ok() {
        view.mark_dirty(base, length);
    }
    view.unlock_range(base, length);
    copied
}

/// Fills `buffer` from `view` at `offset`
pub async fn copy_from_view(
    view: &dyn MemoryView,
    offset: usize,
    buffer: &mut [u8],
    memory: &dyn PageAccessor,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let (base, length) = span(offset, buffer.len());
    view.async_lock_range(base, length).await?;

    let mut progress = 0;
    let mut copied = Ok(());
    while progress < buffer.len() {
        let address = offset + progress;
        let chunk = core::cmp::min(PAGE_SIZE - page_offset(address), buffer.len() - progress);
        match view.fetch_range(address, FetchFlags::empty()).await {
            Ok(range) => memory.read(range.physical, &mut buffer[progress..progress + chunk]),
            Err(error) => {
                copied = Err(error);
                break;
            }
        }
        progress += chunk;
    }

    view.unlock_range(base, length);
    copied
}

/// Copies `size` bytes from `src` to `dest`
pub async fn transfer_between_views(
    dest: &dyn MemoryView,
    dest_offset: usize,
    src: &dyn MemoryView,
    src_offset: usize,
    size: usize,
    memory: &dyn PageAccessor,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let (dest_base, dest_length) = span(dest_offset, size);
    let (src_base, src_length) = span(src_offset, size);
    dest.async_lock_range(dest_base, dest_length).await?;
    if let Err(error) = src.async_lock_range(src_base, src_length).await {
        dest.unlock_range(dest_base, dest_length);
        return Err(error);
    }

    let mut bounce = vec![0u8; PAGE_SIZE];
    let copied = async {
        let mut progress = 0;
        while progress < size {
            let dest_address = dest_offset + progress;
            let src_address = src_offset + progress;
            let chunk = (size - progress)
                .min(PAGE_SIZE - page_offset(dest_address))
                .min(PAGE_SIZE - page_offset(src_address));
            let from = src.fetch_range(src_address, FetchFlags::empty()).await?;
            let to = dest.fetch_range(dest_address, FetchFlags::WRITE).await?;
            memory.read(from.physical, &mut bounce[..chunk]);
            memory.write(to.physical, &bounce[..chunk]);
            progress += chunk;
        }
        Ok::<(), Error>(())
    }
    .await;

    if copied.is_ok() {
        dest.mark_dirty(dest_base, dest_length);
    }
    src.unlock_range(src_base, src_length);
    dest.unlock_range(dest_base, dest_length);
    copied
}
