/// A [`presser::Slab`] over the CPU view of persistently mapped memory.
///
/// Holding the mutable borrow for the lifetime of the slab keeps the mapping from being aliased
/// while data is copied into it.
pub struct MappedSlab<'a> {
    mapped: &'a mut [u8],
}

impl<'a> MappedSlab<'a> {
    pub fn new(mapped: &'a mut [u8]) -> Self {
        Self { mapped }
    }
}

// SAFETY: a slice is a single allocation of `len` initialized bytes, and `len` never exceeds
// `isize::MAX`.
unsafe impl<'a> presser::Slab for MappedSlab<'a> {
    fn base_ptr(&self) -> *const u8 {
        self.mapped.as_ptr()
    }

    fn base_ptr_mut(&mut self) -> *mut u8 {
        self.mapped.as_mut_ptr()
    }

    fn size(&self) -> usize {
        self.mapped.len()
    }
}
