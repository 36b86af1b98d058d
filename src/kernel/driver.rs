use crate::error::Result;

/// Non-error answers a driver can give from its polling entry points.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverReply {
    /// Data was produced (or accepted).
    Ok,
    /// A lifecycle phase finished: end of the initial transfer, or
    /// end of the prepare phase.
    Ready,
    /// No data yet, call again.
    Processing,
    /// Resources busy, call again.
    Busy,
    /// The driver has finished.
    Done,
}

/// Data transfer buffer between the kernel and a driver.
///
/// The kernel preallocates the storage (one block); the driver fills a
/// prefix, records the filled size and tags the buffer with the target
/// table number within its snapshot and the LAST flag.
pub struct Buffer {
    data: Box<[u8]>,
    size: usize,
    /// Table number within the driver's snapshot.
    pub table_num: u32,
    /// Set on the final buffer of a table's stream.
    pub last: bool,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
            table_num: 0,
            last: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Writable storage; fill a prefix and call
    /// [`set_size`](Buffer::set_size).
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.data.len());
        self.size = size;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Filled part of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Copy `data` into the buffer.
    pub fn fill(&mut self, data: &[u8]) {
        assert!(data.len() <= self.data.len());
        self.data[..data.len()].copy_from_slice(data);
        self.size = data.len();
    }

    pub(crate) fn reset(&mut self) {
        self.size = 0;
        self.table_num = 0;
        self.last = false;
    }
}

/// One data chunk handed to a restore driver.
pub struct DataSlice<'a> {
    pub data: &'a [u8],
    pub table_num: u32,
    pub last: bool,
}

/// Contract of a backup driver.
///
/// The kernel polls cooperatively: no method may block indefinitely.
/// Anything that would (such as acquiring table locks) must run in a
/// helper thread while [`get_data`](BackupDriver::get_data) keeps
/// answering `Processing`/`Busy`.
pub trait BackupDriver {
    /// Estimated bytes of the initial (pre-lock) transfer; `None` if
    /// unknown.
    fn init_size(&self) -> Option<u64>;

    /// Acquire resources and open the data source. `block_size` is
    /// the size of the buffers later passed to `get_data`.
    fn begin(&mut self, block_size: usize) -> Result<()>;

    /// One polling step: fill `buf` or report a state transition.
    fn get_data(&mut self, buf: &mut Buffer) -> Result<DriverReply>;

    /// Start preparing the validity point without blocking. `Ready`
    /// if no preparation is needed, `Ok` if preparation was launched.
    fn prelock(&mut self) -> Result<DriverReply>;

    /// Create the validity point now; the driver already prepared.
    fn lock(&mut self) -> Result<()>;

    /// Release the validity point locks. Only final data remains
    /// after this.
    fn unlock(&mut self) -> Result<()>;

    /// Orderly shutdown after `Done`.
    fn end(&mut self) -> Result<()>;

    /// Abort; best effort, errors are ignored by the kernel.
    fn cancel(&mut self) -> Result<()>;
}

/// Contract of a restore driver.
pub trait RestoreDriver {
    fn begin(&mut self, block_size: usize) -> Result<()>;

    /// Accept one data chunk. `Processing`/`Busy` ask the kernel to
    /// resend the same chunk.
    fn send_data(&mut self, chunk: &DataSlice) -> Result<DriverReply>;

    /// End of stream: finish restoring (apply logs, rebuild indexes).
    fn end(&mut self) -> Result<()>;

    fn cancel(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_fill_and_reset() {
        let mut buf = Buffer::new(16);
        assert_eq!(buf.capacity(), 16);
        buf.fill(b"hello");
        buf.table_num = 3;
        buf.last = true;
        assert_eq!(buf.bytes(), b"hello");
        buf.reset();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.table_num, 0);
        assert!(!buf.last);
    }

    #[test]
    fn buffer_space_writes_through() {
        let mut buf = Buffer::new(8);
        buf.space()[..3].copy_from_slice(b"abc");
        buf.set_size(3);
        assert_eq!(buf.bytes(), b"abc");
    }
}
