//! The per-connection byte buffer.
//!
//! A `Buffer` is one contiguous allocation split into three regions:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |    (CONTENT)     |                  |
//! +-------------------+------------------+------------------+
//! 0        <=       reader     <=      writer      <=     len
//! ```
//!
//! Data read off a socket lands in the writable region; data waiting to be
//! consumed (by user code on the receive side, by the socket on the send
//! side) sits in the readable region. The prependable region never shrinks
//! below [`Buffer::CHEAP_PREPEND`] bytes across resets, so a length prefix
//! can be stuck in front of the content in O(1), without shifting anything.
//!
//! Draining everything snaps both indices back to the start, which is what
//! keeps appends amortized linear. When the writable region runs short, the
//! buffer first tries to reclaim the already-consumed front by sliding the
//! content down, and only grows the allocation when even that is not enough.

use std::os::fd::RawFd;

use nix::errno::Errno;

/// Size of the stack-side overflow region for [`Buffer::read_fd`].
const EXTRA_BUF: usize = 65536;

/// A growable three-region byte buffer.
///
/// Owned exclusively by its connection and never aliased; all methods take
/// plain `&self`/`&mut self` and leave thread-safety to the owner.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    /// Headroom kept in front of the content for cheap prepends.
    pub const CHEAP_PREPEND: usize = 8;
    /// Default size of the region behind the headroom.
    pub const INITIAL_SIZE: usize = 1024;

    /// A buffer with the default capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    /// A buffer with `initial` bytes of space behind the prepend headroom.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            data: vec![0; Buffer::CHEAP_PREPEND + initial],
            reader: Buffer::CHEAP_PREPEND,
            writer: Buffer::CHEAP_PREPEND,
        }
    }

    /// An allocation-free placeholder.
    ///
    /// Used to take a real buffer out of its slot for the duration of a user
    /// callback and put it back afterwards (the same take-out/put-back dance
    /// the event dispatch does with callbacks). Never read while swapped in.
    pub(crate) fn stolen() -> Buffer {
        Buffer {
            data: Vec::new(),
            reader: 0,
            writer: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// A view of the content. Valid until the next mutating call.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Consume `len` bytes from the front of the content.
    ///
    /// Consuming everything resets both indices to the headroom mark, so the
    /// whole buffer becomes writable again.
    ///
    /// # Panics
    ///
    /// If `len` exceeds [`readable_bytes`](Buffer::readable_bytes).
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Drop all content and reset the indices.
    pub fn retrieve_all(&mut self) {
        self.reader = Buffer::CHEAP_PREPEND;
        self.writer = Buffer::CHEAP_PREPEND;
    }

    /// Copy `len` bytes out of the front and consume them.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    /// Copy the whole content out and reset.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.take(self.readable_bytes())
    }

    /// Append `data` behind the content, making space first if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Stick `data` in front of the content, eating into the headroom.
    ///
    /// This is the cheap-prepend operation the headroom exists for, typically
    /// a length prefix written after the payload is complete.
    ///
    /// # Panics
    ///
    /// If the headroom is smaller than `data`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Make sure at least `len` bytes are writable.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Buffer::CHEAP_PREPEND {
            // Even compaction would not make enough room. Grow.
            self.data.resize(self.writer + len, 0);
        } else {
            // There's enough dead space in front of the content. Slide the
            // content down to the headroom mark and the writable region
            // becomes contiguous again, no allocation needed.
            //
            let readable = self.readable_bytes();
            self.data.copy_within(self.reader..self.writer, Buffer::CHEAP_PREPEND);
            self.reader = Buffer::CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Fill the buffer from a file descriptor with a scatter read.
    ///
    /// Reads into the writable region and, when that region is smaller than
    /// 64 KiB, into a stack-side overflow region as well. Whatever lands in
    /// the overflow is appended afterwards. One syscall therefore moves up to
    /// `writable + 64 KiB` bytes even on a freshly reset default buffer,
    /// which keeps the syscall count bounded on large bursts.
    ///
    /// Returns the byte count from the OS (0 means the peer closed its write
    /// half) or the raw errno.
    pub fn read_fd(&mut self, fd: RawFd) -> Result<usize, Errno> {
        let mut extra = [0u8; EXTRA_BUF];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.data[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // The overflow region only participates while the direct region is
        // smaller than it.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        // SAFETY: both iovecs point at live writable memory of at least the
        // stated lengths for the duration of the call.
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(Errno::last());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Push the content at a file descriptor.
    ///
    /// A plain write of the readable region. The caller decides how much to
    /// [`retrieve`](Buffer::retrieve) based on the returned count; partial
    /// writes are normal on a nonblocking socket.
    pub fn write_fd(&self, fd: RawFd) -> Result<usize, Errno> {
        // SAFETY: the readable region is initialized memory of the stated
        // length.
        let n = unsafe {
            libc::write(
                fd,
                self.peek().as_ptr() as *const libc::c_void,
                self.readable_bytes(),
            )
        };
        if n < 0 {
            return Err(Errno::last());
        }
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use proptest::prelude::*;

    use super::*;

    fn os_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        // SAFETY: freshly created fds, owned by nobody else
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn pipe_feed(fd: &OwnedFd, data: &[u8]) {
        let n = unsafe {
            libc::write(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len())
        };
        assert_eq!(data.len() as isize, n);
    }

    #[test]
    fn fresh_buffer() {
        let buf = Buffer::new();
        assert_eq!(0, buf.readable_bytes());
        assert_eq!(Buffer::INITIAL_SIZE, buf.writable_bytes());
        assert_eq!(Buffer::CHEAP_PREPEND, buf.prependable_bytes());
    }

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(5, buf.readable_bytes());
        assert_eq!(b"hello", buf.peek());

        buf.retrieve(2);
        assert_eq!(b"llo", buf.peek());
        assert_eq!(Buffer::CHEAP_PREPEND + 2, buf.prependable_bytes());

        // Draining the rest resets the indices completely
        buf.retrieve(3);
        assert_eq!(0, buf.readable_bytes());
        assert_eq!(Buffer::CHEAP_PREPEND, buf.reader);
        assert_eq!(Buffer::CHEAP_PREPEND, buf.writer);
    }

    #[test]
    fn take_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"one");
        buf.append(b"two");
        assert_eq!(b"onetwo".to_vec(), buf.take_all());
        assert_eq!(Buffer::CHEAP_PREPEND, buf.prependable_bytes());
    }

    #[test]
    fn compaction_without_realloc() {
        let mut buf = Buffer::new();
        let total = buf.data.len();
        buf.append(&[b'a'; 1000]);
        buf.retrieve(900);
        buf.append(&[b'b'; 400]); // Doesn't fit behind, fits after compaction
        assert_eq!(total, buf.data.len());
        assert_eq!(Buffer::CHEAP_PREPEND, buf.reader);
        assert_eq!(500, buf.readable_bytes());
        let mut expected = vec![b'a'; 100];
        expected.extend_from_slice(&[b'b'; 400]);
        assert_eq!(&expected[..], buf.peek());
    }

    #[test]
    fn growth_when_compaction_is_not_enough() {
        let mut buf = Buffer::new();
        buf.append(&[b'x'; 1000]);
        buf.append(&[b'y'; 600]);
        assert!(buf.data.len() > Buffer::CHEAP_PREPEND + Buffer::INITIAL_SIZE);
        assert_eq!(1600, buf.readable_bytes());
    }

    #[test]
    fn prepend_headroom() {
        // Append a payload, then stick a 4-byte length header in front.
        let mut buf = Buffer::new();
        let before = buf.data.len();
        buf.append(&[b'p'; 16]);
        buf.prepend(&16u32.to_be_bytes());
        assert_eq!(before, buf.data.len()); // No reallocation
        assert_eq!(20, buf.readable_bytes());
        assert_eq!(&16u32.to_be_bytes(), &buf.peek()[..4]);
        assert_eq!(&[b'p'; 16], &buf.peek()[4..]);
    }

    #[test]
    fn scatter_read_fits_directly() {
        let (r, w) = os_pipe();
        pipe_feed(&w, b"ping");
        let mut buf = Buffer::new();
        assert_eq!(Ok(4), buf.read_fd(r.as_raw_fd()));
        assert_eq!(b"ping", buf.peek());
    }

    #[test]
    fn scatter_read_overflows_into_extra() {
        let (r, w) = os_pipe();
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        pipe_feed(&w, &payload);

        // Default buffer has 1024 writable bytes, so most of the payload has
        // to come in through the overflow region.
        let mut buf = Buffer::new();
        let writable = buf.writable_bytes();
        assert!(writable < payload.len());
        assert_eq!(Ok(payload.len()), buf.read_fd(r.as_raw_fd()));
        assert_eq!(payload.len(), buf.readable_bytes());
        assert_eq!(&payload[..], buf.peek());
    }

    #[test]
    fn read_fd_reports_eof() {
        let (r, w) = os_pipe();
        drop(w);
        let mut buf = Buffer::new();
        assert_eq!(Ok(0), buf.read_fd(r.as_raw_fd()));
    }

    #[test]
    fn write_fd_then_retrieve() {
        let (r, w) = os_pipe();
        let mut buf = Buffer::new();
        buf.append(b"bye");
        let n = buf.write_fd(w.as_raw_fd()).unwrap();
        buf.retrieve(n);
        assert_eq!(0, buf.readable_bytes());

        let mut back = Buffer::new();
        assert_eq!(Ok(3), back.read_fd(r.as_raw_fd()));
        assert_eq!(b"bye", back.peek());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(Vec<u8>),
        // Fraction of the current content to retrieve, in percent
        Retrieve(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..2000).prop_map(Op::Append),
            (0..=100u8).prop_map(Op::Retrieve),
        ]
    }

    proptest! {
        /// Any sequence of appends and retrieves keeps the index invariants
        /// and agrees with a naive reference model.
        #[test]
        fn invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let mut buf = Buffer::new();
            let mut model: Vec<u8> = Vec::new();
            for op in ops {
                match op {
                    Op::Append(data) => {
                        buf.append(&data);
                        model.extend_from_slice(&data);
                    },
                    Op::Retrieve(pct) => {
                        let len = buf.readable_bytes() * pct as usize / 100;
                        buf.retrieve(len);
                        model.drain(..len);
                    },
                }
                prop_assert!(buf.reader <= buf.writer);
                prop_assert!(buf.writer <= buf.data.len());
                prop_assert_eq!(&model[..], buf.peek());
                if buf.readable_bytes() == 0 {
                    prop_assert!(buf.prependable_bytes() >= Buffer::CHEAP_PREPEND);
                }
            }
        }

        /// Appending any byte sequence and draining it gives the sequence back.
        #[test]
        fn round_trip(data in proptest::collection::vec(any::<u8>(), 0..5000)) {
            let mut buf = Buffer::new();
            buf.append(&data);
            prop_assert_eq!(data, buf.take_all());
        }
    }
}
