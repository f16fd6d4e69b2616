/// Receive buffer with a read cursor (`tail`) and a write cursor (`head`).
///
/// Bytes in `tail..head` are received but not yet parsed. `try_shrink` moves
/// them to the front once the write cursor hits the end; a buffer that is
/// completely full of unparsed bytes doubles instead.
pub struct Buffer {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0; capacity.max(1)],
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn data_size(&self) -> usize {
        self.head - self.tail
    }

    pub fn get_data(&self) -> &[u8] {
        &self.buf[self.tail..self.head]
    }

    pub fn push_data(&mut self, size: usize) {
        self.head += size;
        assert!(self.head <= self.buf.len());
    }

    pub fn pull_data(&mut self, size: usize) {
        assert!(size <= self.data_size());
        self.tail += size;
    }

    pub fn get_free_space(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn get_empty_buf(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    /// Makes room for the next read. Afterwards `get_free_space() > 0`.
    pub fn try_shrink(&mut self) {
        if self.data_size() == 0 {
            self.head = 0;
            self.tail = 0;
            return;
        }

        if self.head < self.buf.len() {
            return;
        }

        if self.data_size() == self.buf.len() {
            let len = self.buf.len();
            self.buf.resize(len * 2, 0);
            return;
        }

        self.buf.copy_within(self.tail..self.head, 0);
        self.head = self.data_size();
        self.tail = 0;
    }
}
