//! Memory BIO duplex buffer
//!
//! A [`MemoryBio`] is one direction of an in-memory transport. The
//! application writes ciphertext received from the network into the
//! incoming buffer and drains ciphertext to send from the outgoing buffer;
//! the connection's engine does the opposite through the crate-internal
//! `fill` / `feed` side.

use crate::error::TlsError;
use crate::Result;
use bytes::{Buf, BytesMut};
use libc::c_int;
use openssl::error::ErrorStack;
use openssl_sys as sys;
use parking_lot::Mutex;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, Default)]
struct BioBuffer {
    data: BytesMut,
    eof_written: bool,
}

/// Shared in-memory byte pipe
///
/// Clones refer to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryBio {
    inner: Arc<Mutex<BioBuffer>>,
}

impl MemoryBio {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, returning how many were written
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.len() > c_int::MAX as usize {
            return Err(TlsError::Overflow(format!(
                "string longer than {} bytes",
                c_int::MAX
            )));
        }

        let mut buf = self.inner.lock();
        if buf.eof_written {
            return Err(TlsError::State("cannot write() after write_eof()".into()));
        }
        buf.data.extend_from_slice(data);
        Ok(data.len())
    }

    /// Mark the end of the stream; later writes fail
    pub fn write_eof(&self) {
        self.inner.lock().eof_written = true;
    }

    /// Read up to `size` bytes, or everything pending for `None`
    ///
    /// An empty result means "no data yet" unless [`MemoryBio::eof`] is true.
    pub fn read(&self, size: Option<usize>) -> Vec<u8> {
        let mut buf = self.inner.lock();
        let n = size.map_or(buf.data.len(), |s| s.min(buf.data.len()));
        buf.data.split_to(n).to_vec()
    }

    /// Number of buffered bytes
    pub fn pending(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Nothing is pending and the writer signalled EOF
    pub fn eof(&self) -> bool {
        let buf = self.inner.lock();
        buf.eof_written && buf.data.is_empty()
    }

    /// Engine-side read: `WouldBlock` when empty, 0 on EOF
    pub(crate) fn fill(&self, out: &mut [u8]) -> io::Result<usize> {
        let mut buf = self.inner.lock();
        if buf.data.is_empty() {
            if buf.eof_written || out.is_empty() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = out.len().min(buf.data.len());
        out[..n].copy_from_slice(&buf.data[..n]);
        buf.data.advance(n);
        Ok(n)
    }

    /// Engine-side write: always appends
    pub(crate) fn feed(&self, data: &[u8]) -> usize {
        self.inner.lock().data.extend_from_slice(data);
        data.len()
    }
}

/// Read-only engine BIO over a borrowed slice
pub(crate) struct MemBioSlice<'a>(*mut sys::BIO, PhantomData<&'a [u8]>);

impl Drop for MemBioSlice<'_> {
    fn drop(&mut self) {
        unsafe {
            sys::BIO_free_all(self.0);
        }
    }
}

impl<'a> MemBioSlice<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Result<MemBioSlice<'a>> {
        if buf.len() > c_int::MAX as usize {
            return Err(TlsError::Overflow(format!(
                "data longer than {} bytes",
                c_int::MAX
            )));
        }

        let bio = unsafe { sys::BIO_new_mem_buf(buf.as_ptr() as *const _, buf.len() as c_int) };
        if bio.is_null() {
            return Err(ErrorStack::get().into());
        }

        Ok(MemBioSlice(bio, PhantomData))
    }

    pub(crate) fn as_ptr(&self) -> *mut sys::BIO {
        self.0
    }
}
