//! Kernel-buffered pipe: a fixed-size circular byte buffer with
//! blocking read and write.
//!
//! Each pipe tracks how many open-file references exist to its read and
//! write side; `pipe`, `dup`, `close`, and fork-time inheritance keep
//! the counts equal to the sum of the entries' reference counts. A read
//! from an empty pipe with no writers left returns the bytes gathered
//! so far (zero bytes is end of stream); a write with no readers left
//! fails outright.

use std::sync::{Arc, Mutex};

use crate::lock::WaitChannel;

pub(crate) const MAX_PIPE_SIZE: usize = 4000;

struct PipeInner {
    data: Box<[u8; MAX_PIPE_SIZE]>,
    read_off: usize,
    write_off: usize,
    data_count: usize,

    /// Open-file references to the read side.
    readers: u32,

    /// Open-file references to the write side.
    writers: u32,
}

pub(crate) struct Pipe {
    inner: Mutex<PipeInner>,

    /// There are unread bytes in data.
    read_wait: WaitChannel,

    /// There is room in data.
    write_wait: WaitChannel,
}

impl Pipe {
    /// A fresh pipe with one reference on each side.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PipeInner {
                data: Box::new([0; MAX_PIPE_SIZE]),
                read_off: 0,
                write_off: 0,
                data_count: 0,
                readers: 1,
                writers: 1,
            }),
            read_wait: WaitChannel::new(),
            write_wait: WaitChannel::new(),
        })
    }

    /// Read until `dst` is full, sleeping while the buffer is empty.
    /// Once the last writer is gone and the buffer drains, returns the
    /// bytes gathered so far.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock().unwrap();
        let mut nread = 0;
        while nread < dst.len() {
            while inner.data_count == 0 {
                if inner.writers == 0 {
                    return Ok(nread);
                }
                inner = self.read_wait.sleep(inner);
            }
            {
                let pi = &mut *inner;
                while nread < dst.len() && pi.data_count > 0 {
                    dst[nread] = pi.data[pi.read_off];
                    nread += 1;
                    pi.read_off = (pi.read_off + 1) % MAX_PIPE_SIZE;
                    pi.data_count -= 1;
                }
            }
            self.write_wait.wakeup();
        }
        Ok(nread)
    }

    /// Write all of `src`, sleeping while the buffer is full. Fails as
    /// soon as no read reference remains.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.readers == 0 {
            return Err(());
        }
        let mut nwritten = 0;
        while nwritten < src.len() {
            while inner.data_count == MAX_PIPE_SIZE {
                if inner.readers == 0 {
                    return Err(());
                }
                inner = self.write_wait.sleep(inner);
            }
            {
                let pi = &mut *inner;
                while nwritten < src.len() && pi.data_count < MAX_PIPE_SIZE {
                    pi.data[pi.write_off] = src[nwritten];
                    nwritten += 1;
                    pi.write_off = (pi.write_off + 1) % MAX_PIPE_SIZE;
                    pi.data_count += 1;
                }
            }
            self.read_wait.wakeup();
        }
        Ok(nwritten)
    }

    /// Drop one open-file reference to a side; sleepers on both sides
    /// re-check their end-of-stream conditions.
    pub fn close(&self, writable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if writable {
            assert!(inner.writers > 0, "pipe: close without writer");
            inner.writers -= 1;
        } else {
            assert!(inner.readers > 0, "pipe: close without reader");
            inner.readers -= 1;
        }
        drop(inner);
        self.read_wait.wakeup();
        self.write_wait.wakeup();
    }

    /// Add one open-file reference to a side (dup or fork).
    pub fn add_ref(&self, writable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if writable {
            inner.writers += 1;
        } else {
            inner.readers += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bytes_emerge_in_fifo_order() {
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"abcdef"), Ok(6));
        let mut out = [0u8; 6];
        assert_eq!(pipe.read(&mut out), Ok(6));
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn read_returns_partial_then_eof_after_last_writer_closes() {
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"hi"), Ok(2));
        pipe.close(true);

        let mut out = [0u8; 100];
        assert_eq!(pipe.read(&mut out), Ok(2));
        assert_eq!(&out[..2], b"hi");
        assert_eq!(pipe.read(&mut out), Ok(0));
    }

    #[test]
    fn write_fails_once_all_readers_close() {
        let pipe = Pipe::new();
        pipe.close(false);
        assert_eq!(pipe.write(b"x"), Err(()));
    }

    #[test]
    fn writer_blocks_on_full_buffer_until_reader_drains() {
        let pipe = Pipe::new();
        let data = vec![7u8; MAX_PIPE_SIZE + 100];

        let writer = {
            let pipe = Arc::clone(&pipe);
            let data = data.clone();
            thread::spawn(move || pipe.write(&data))
        };

        let mut out = vec![0u8; MAX_PIPE_SIZE + 100];
        assert_eq!(pipe.read(&mut out), Ok(MAX_PIPE_SIZE + 100));
        assert_eq!(out, data);
        assert_eq!(writer.join().unwrap(), Ok(MAX_PIPE_SIZE + 100));
    }

    #[test]
    fn reader_blocks_until_writer_fills_request() {
        let pipe = Pipe::new();
        let writer = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || {
                for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
                    pipe.write(chunk).unwrap();
                }
                pipe.close(true);
            })
        };

        let mut out = [0u8; 11];
        assert_eq!(pipe.read(&mut out), Ok(11));
        assert_eq!(&out, b"onetwothree");
        writer.join().unwrap();
    }

    #[test]
    fn wraparound_preserves_byte_order() {
        let pipe = Pipe::new();
        let mut out = vec![0u8; MAX_PIPE_SIZE - 1];
        // Leave the offsets near the end of the ring, then cross it.
        pipe.write(&vec![1u8; MAX_PIPE_SIZE - 1]).unwrap();
        pipe.read(&mut out).unwrap();

        let pattern: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(pipe.write(&pattern), Ok(200));
        let mut got = vec![0u8; 200];
        assert_eq!(pipe.read(&mut got), Ok(200));
        assert_eq!(got, pattern);
    }
}
