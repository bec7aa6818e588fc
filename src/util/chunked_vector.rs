//! A vector of fixed-size opaque elements stored in stable chunks.
//!
//! Hash-table entries and sorter tuples are handed out as raw pointers that
//! must stay valid for the life of their container, so the backing store can
//! never reallocate in place. Elements live in fixed-capacity chunks; a full
//! chunk is sealed and a new one is started.

/// Target byte size of one chunk.
const CHUNK_BYTES: usize = 16 * 1024;

pub struct ChunkedVector {
    chunks: Vec<Box<[u8]>>,
    element_size: usize,
    elements_per_chunk: usize,
    /// Elements used in the active (last) chunk.
    active_len: usize,
    len: usize,
}

impl ChunkedVector {
    pub fn new(element_size: usize) -> Self {
        assert!(element_size > 0, "element size must be non-zero");
        ChunkedVector {
            chunks: Vec::new(),
            element_size,
            elements_per_chunk: (CHUNK_BYTES / element_size).max(1),
            active_len: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a zero-initialized element and returns its stable address.
    pub fn append(&mut self) -> *mut u8 {
        if self.chunks.is_empty() || self.active_len == self.elements_per_chunk {
            let chunk = vec![0u8; self.element_size * self.elements_per_chunk].into_boxed_slice();
            self.chunks.push(chunk);
            self.active_len = 0;
        }
        let chunk = self.chunks.last_mut().unwrap();
        let ptr = unsafe { chunk.as_mut_ptr().add(self.active_len * self.element_size) };
        self.active_len += 1;
        self.len += 1;
        ptr
    }

    /// Returns the address of element `idx`.
    pub fn at(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.len);
        let chunk = idx / self.elements_per_chunk;
        let slot = idx % self.elements_per_chunk;
        unsafe { self.chunks[chunk].as_ptr().add(slot * self.element_size) as *mut u8 }
    }

    /// Iterates the addresses of all elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = *mut u8> + '_ {
        (0..self.len).map(move |idx| self.at(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut cv = ChunkedVector::new(8);
        let mut ptrs = Vec::new();
        for i in 0..5000u64 {
            let ptr = cv.append();
            unsafe { (ptr as *mut u64).write_unaligned(i) };
            ptrs.push(ptr);
        }
        assert_eq!(cv.len(), 5000);
        for (i, &ptr) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { (ptr as *const u64).read_unaligned() }, i as u64);
            assert_eq!(cv.at(i), ptr);
        }
    }

    #[test]
    fn elements_are_zeroed() {
        let mut cv = ChunkedVector::new(16);
        for _ in 0..100 {
            let ptr = cv.append();
            let bytes = unsafe { std::slice::from_raw_parts(ptr, 16) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn moved_storage_keeps_addresses_alive() {
        // The transfer pattern the hash tables and sorter use: swap the
        // storage out whole, keep it alive in an owned list.
        let mut source = ChunkedVector::new(8);
        let ptr = source.append();
        unsafe { (ptr as *mut u64).write_unaligned(42) };

        let mut adopted = ChunkedVector::new(8);
        std::mem::swap(&mut adopted, &mut source);
        assert_eq!(source.len(), 0);
        assert_eq!(adopted.len(), 1);
        assert_eq!(unsafe { (ptr as *const u64).read_unaligned() }, 42);
    }
}
