//! Allocation-free stderr output for paths where tracing cannot be trusted.

use std::fmt;

/// Formats into a fixed stack buffer, truncating on overflow.
pub struct StackWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> StackWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

impl fmt::Write for StackWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let n = bytes.len().min(self.buf.len() - self.pos);
        self.buf[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += n;
        Ok(())
    }
}

/// Write one line to fd 2 with a raw `write(2)` syscall.
#[macro_export]
macro_rules! raw_eprintln {
    ($($arg:tt)*) => {{
        use std::fmt::Write as _;
        let mut buf = [0u8; 512];
        let mut w = $crate::macros::StackWriter::new(&mut buf);
        let _ = write!(w, $($arg)*);
        let _ = w.write_str("\n");
        let bytes = w.as_bytes();
        unsafe {
            libc::syscall(
                libc::SYS_write,
                2 as libc::c_long,
                bytes.as_ptr(),
                bytes.len(),
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_stack_writer_truncates() {
        let mut buf = [0u8; 8];
        let mut w = StackWriter::new(&mut buf);
        write!(w, "cfs: {}", "overflowing").unwrap();
        assert_eq!(w.as_bytes(), b"cfs: ove");
    }
}
