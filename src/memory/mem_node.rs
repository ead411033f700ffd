use {
    crate::{
        memory::{align_up, AllocationKind, MemoryBackend, PAGE_SIZE},
        PrettyPages, PrettySize, RenderError,
    },
    ash::vk,
    std::ptr::NonNull,
};

/// A host pointer into mapped device memory.
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct HostPtr(NonNull<u8>);

// The pointer targets device memory which is owned by the node; all host
// access goes through MappedRegion which borrows the block.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub(crate) fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The pointer `offset` bytes past this one.
    ///
    /// # Safety
    ///
    /// Unsafe because the offset must lie within the mapped region.
    pub(crate) unsafe fn add(&self, offset: u64) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)))
    }
}

impl std::fmt::Debug for HostPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:p}", self.0))
    }
}

/// A contiguous region of device memory measured in pages.
///
/// Pool nodes are bump-allocated through [MemNode::suballocate]. Dedicated
/// nodes back exactly one resource and are returned to the driver when that
/// resource is destroyed.
pub struct MemNode {
    memory: vk::DeviceMemory,
    memory_type_index: usize,
    size_in_bytes: u64,
    offset: u64,
    ptr: Option<HostPtr>,
    last_kind: AllocationKind,
    dedicated: bool,
}

// Public API
// ----------

impl MemNode {
    /// The underlying Vulkan memory handle.
    ///
    /// # Safety
    ///
    /// Unsafe because the node logically owns the device memory. It is
    /// incorrect to free the memory by any means other than returning the
    /// node to the allocator.
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn memory_type_index(&self) -> usize {
        self.memory_type_index
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// The node size in whole pages. Dedicated nodes are rounded up.
    pub fn pages(&self) -> u64 {
        self.size_in_bytes.div_ceil(PAGE_SIZE)
    }

    /// The bump cursor: every byte before this offset has been handed out.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_mapped(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn last_kind(&self) -> AllocationKind {
        self.last_kind
    }
}

impl std::fmt::Debug for MemNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNode")
            .field("memory", &self.memory)
            .field("memory_type_index", &self.memory_type_index)
            .field("size", &PrettyPages(self.pages()))
            .field("offset", &PrettySize(self.offset))
            .field("ptr", &self.ptr)
            .field("last_kind", &self.last_kind)
            .field("dedicated", &self.dedicated)
            .finish()
    }
}

// Private API
// -----------

impl MemNode {
    pub(crate) fn new(
        memory: vk::DeviceMemory,
        memory_type_index: usize,
        size_in_bytes: u64,
        dedicated: bool,
    ) -> Self {
        Self {
            memory,
            memory_type_index,
            size_in_bytes,
            offset: 0,
            ptr: None,
            last_kind: AllocationKind::Unknown,
            dedicated,
        }
    }

    /// Map the whole node. Repeated calls return the existing mapping.
    ///
    /// # Safety
    ///
    /// Unsafe because the node's memory type must be host visible.
    pub(crate) unsafe fn map(
        &mut self,
        backend: &mut dyn MemoryBackend,
    ) -> Result<HostPtr, RenderError> {
        if let Some(ptr) = self.ptr {
            return Ok(ptr);
        }
        let ptr = backend.map(self.memory)?;
        let ptr = HostPtr::new(ptr).ok_or_else(|| {
            RenderError::AllocationFailure(
                "vkMapMemory returned a null pointer".to_owned(),
            )
        })?;
        self.ptr = Some(ptr);
        Ok(ptr)
    }

    pub(crate) fn host_ptr(&self) -> Option<HostPtr> {
        self.ptr
    }

    /// Rewind the bump cursor so the node can serve a new pool.
    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
        self.last_kind = AllocationKind::Unknown;
    }

    /// Where a new block with the given constraints would begin.
    ///
    /// `atom_size` is zero for coherent memory. `granularity` only applies
    /// when the previous block's kind conflicts with `kind`.
    pub(crate) fn aligned_offset(
        &self,
        alignment: u64,
        atom_size: u64,
        granularity: u64,
        kind: AllocationKind,
    ) -> u64 {
        let mut offset = align_up(self.offset, alignment);
        if atom_size > 1 {
            offset = align_up(offset, atom_size);
        }
        if self.last_kind.conflicts_with(kind) {
            offset = align_up(offset, granularity);
        }
        offset
    }

    /// Bump-allocate a block. Returns None if the block does not fit.
    pub(crate) fn suballocate(
        &mut self,
        size_in_bytes: u64,
        alignment: u64,
        atom_size: u64,
        granularity: u64,
        kind: AllocationKind,
    ) -> Option<MemBlock> {
        let offset =
            self.aligned_offset(alignment, atom_size, granularity, kind);
        let end = offset.checked_add(size_in_bytes)?;
        if end > self.size_in_bytes {
            return None;
        }
        self.offset = if atom_size > 1 {
            align_up(end, atom_size).min(self.size_in_bytes)
        } else {
            end
        };
        if kind != AllocationKind::Unknown {
            self.last_kind = kind;
        }
        Some(MemBlock {
            memory: self.memory,
            offset,
            size_in_bytes,
            memory_type_index: self.memory_type_index,
            ptr: self.ptr.map(|ptr| unsafe { ptr.add(offset) }),
            atom_size,
        })
    }
}

/// A suballocation inside a [MemNode].
///
/// Blocks are never individually returned: the pool which created them
/// recycles the owning node as a whole.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemBlock {
    memory: vk::DeviceMemory,
    offset: u64,
    size_in_bytes: u64,
    memory_type_index: usize,
    ptr: Option<HostPtr>,
    atom_size: u64,
}

impl MemBlock {
    /// The Vulkan memory handle shared by every block in the node.
    ///
    /// # Safety
    ///
    /// Unsafe because the block does not own the memory.
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset_in_bytes(&self) -> u64 {
        self.offset
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn memory_type_index(&self) -> usize {
        self.memory_type_index
    }

    pub fn is_mapped(&self) -> bool {
        self.ptr.is_some()
    }

    /// True when host writes must be flushed explicitly.
    pub fn needs_flush(&self) -> bool {
        self.ptr.is_some() && self.atom_size > 1
    }

    pub(crate) fn host_ptr(&self) -> Option<HostPtr> {
        self.ptr
    }

    pub(crate) fn atom_size(&self) -> u64 {
        self.atom_size
    }

    /// A block covering a whole dedicated node.
    pub(crate) fn for_node(node: &MemNode, atom_size: u64) -> Self {
        Self {
            memory: node.memory,
            offset: 0,
            size_in_bytes: node.size_in_bytes,
            memory_type_index: node.memory_type_index,
            ptr: node.ptr,
            atom_size,
        }
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("memory", &self.memory)
            .field("offset", &PrettySize(self.offset))
            .field("size", &PrettySize(self.size_in_bytes))
            .field("memory_type_index", &self.memory_type_index)
            .field("mapped", &self.ptr.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use {super::*, ash::vk::Handle, pretty_assertions::assert_eq};

    fn node(size: u64) -> MemNode {
        MemNode::new(vk::DeviceMemory::from_raw(1), 0, size, false)
    }

    #[test]
    fn blocks_are_bump_allocated() {
        let mut node = node(1024);
        let linear = AllocationKind::Linear;
        let a = node.suballocate(100, 16, 0, 1, linear).unwrap();
        let b = node.suballocate(100, 16, 0, 1, linear).unwrap();
        assert_eq!(a.offset_in_bytes(), 0);
        assert_eq!(b.offset_in_bytes(), 112);
        assert_eq!(node.offset(), 212);
    }

    #[test]
    fn kind_change_aligns_to_granularity() {
        let mut node = node(4096);
        node.suballocate(10, 4, 0, 1024, AllocationKind::Linear).unwrap();
        let image = node
            .suballocate(10, 4, 0, 1024, AllocationKind::Optimal)
            .unwrap();
        assert_eq!(image.offset_in_bytes(), 1024);
        let same_kind = node
            .suballocate(10, 4, 0, 1024, AllocationKind::Optimal)
            .unwrap();
        assert_eq!(same_kind.offset_in_bytes(), 1036);
    }

    #[test]
    fn non_coherent_blocks_are_atom_aligned() {
        let mut node = node(4096);
        let a = node.suballocate(10, 4, 64, 1, AllocationKind::Linear).unwrap();
        let b = node.suballocate(10, 4, 64, 1, AllocationKind::Linear).unwrap();
        assert_eq!(a.offset_in_bytes(), 0);
        assert_eq!(b.offset_in_bytes(), 64);
        assert!(!a.needs_flush(), "unmapped blocks never flush");
    }

    #[test]
    fn oversized_block_does_not_fit() {
        let mut node = node(256);
        assert!(node
            .suballocate(257, 1, 0, 1, AllocationKind::Linear)
            .is_none());
        node.suballocate(200, 1, 0, 1, AllocationKind::Linear).unwrap();
        assert!(node
            .suballocate(100, 1, 0, 1, AllocationKind::Linear)
            .is_none());
        node.rewind();
        assert_eq!(node.offset(), 0);
        assert_eq!(node.last_kind(), AllocationKind::Unknown);
    }
}
