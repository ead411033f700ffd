use {
    crate::{
        memory::{Allocator, MemBlock},
        RenderError,
    },
    anyhow::anyhow,
    std::marker::PhantomData,
};

/// A typed host view of a mapped memory block.
///
/// Non-coherent memory is flushed when the region is dropped. Coherent
/// memory never flushes.
pub struct MappedRegion<'a, T: bytemuck::Pod> {
    allocator: &'a Allocator,
    block: MemBlock,
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T: bytemuck::Pod> MappedRegion<'a, T> {
    /// Map `block` as a slice of as many `T`s as fit.
    ///
    /// # Safety
    ///
    /// Unsafe because:
    ///  - the node owning the block must outlive the region
    ///  - the GPU must not access the block while the region is alive
    pub unsafe fn new(
        allocator: &'a Allocator,
        block: MemBlock,
    ) -> Result<Self, RenderError> {
        let host_ptr = block.host_ptr().ok_or_else(|| {
            anyhow!("{:?} is not mapped into host memory", block)
        })?;
        let ptr = host_ptr.as_ptr() as *mut T;
        if ptr.align_offset(std::mem::align_of::<T>()) != 0 {
            return Err(anyhow!(
                "{:?} is not aligned for {}",
                block,
                std::any::type_name::<T>()
            )
            .into());
        }
        let len =
            block.size_in_bytes() as usize / std::mem::size_of::<T>().max(1);
        Ok(Self {
            allocator,
            block,
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    /// Map `block` for reading data written by the device.
    ///
    /// # Safety
    ///
    /// See [MappedRegion::new].
    pub unsafe fn for_read(
        allocator: &'a Allocator,
        block: MemBlock,
    ) -> Result<Self, RenderError> {
        allocator.invalidate(&block)?;
        Self::new(allocator, block)
    }

    pub fn block(&self) -> &MemBlock {
        &self.block
    }

    /// Flush host writes now instead of waiting for drop.
    pub fn flush(&self) -> Result<(), RenderError> {
        self.allocator.flush(&self.block)
    }
}

impl<'a, T: bytemuck::Pod> std::ops::Deref for MappedRegion<'a, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<'a, T: bytemuck::Pod> std::ops::DerefMut for MappedRegion<'a, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<'a, T: bytemuck::Pod> Drop for MappedRegion<'a, T> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("Unable to flush {:?}: {}", self.block, err);
        }
    }
}
