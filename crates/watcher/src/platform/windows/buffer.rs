//! Double buffer for asynchronous directory reads
//!
//! The OS fills the write half while the worker parses the read half of the
//! previous completion.

#[derive(Debug)]
pub struct BufferPair {
    write: Vec<u8>,
    read: Vec<u8>,
    size: usize,
}

impl BufferPair {
    pub fn new(size: usize) -> Self {
        Self {
            write: vec![0; size],
            read: vec![0; size],
            size,
        }
    }

    /// Size of each half
    pub fn size(&self) -> usize {
        self.size
    }

    /// Reallocate the write half; only valid while no read is pending
    ///
    /// The read half keeps its contents until the next swap, which brings it
    /// to the new size.
    pub fn resize(&mut self, size: usize) {
        self.size = size;
        self.write = vec![0; size];
    }

    /// Hand the filled half to the parser and the other one to the OS
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.write, &mut self.read);
        if self.write.len() != self.size {
            self.write = vec![0; self.size];
        }
    }

    pub fn write_mut(&mut self) -> &mut [u8] {
        &mut self.write
    }

    /// The first `len` bytes of the read half, clamped to its size
    pub fn completed(&self, len: usize) -> &[u8] {
        &self.read[..len.min(self.read.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_exchanges_halves() {
        let mut buffers = BufferPair::new(8);
        buffers.write_mut()[..3].copy_from_slice(b"abc");
        buffers.swap();

        assert_eq!(buffers.completed(3), b"abc");
        assert_eq!(&buffers.write_mut()[..3], &[0, 0, 0]);
    }

    #[test]
    fn test_completed_is_clamped() {
        let buffers = BufferPair::new(4);
        assert_eq!(buffers.completed(4096).len(), 4);
    }

    #[test]
    fn test_resize() {
        let mut buffers = BufferPair::new(1024);
        buffers.resize(64);
        assert_eq!(buffers.size(), 64);
        assert_eq!(buffers.write_mut().len(), 64);
        buffers.swap();
        assert_eq!(buffers.size(), 64);
        assert_eq!(buffers.write_mut().len(), 64);
    }

    #[test]
    fn test_resize_keeps_completed_half() {
        let mut buffers = BufferPair::new(1024);
        buffers.write_mut()[..4].copy_from_slice(b"done");
        buffers.swap();

        buffers.resize(64);
        assert_eq!(buffers.completed(4), b"done");
        assert_eq!(buffers.write_mut().len(), 64);

        // The old half is brought down to size when it is handed out again
        buffers.swap();
        assert_eq!(buffers.write_mut().len(), 64);
        assert_eq!(buffers.completed(1024).len(), 64);
    }
}
