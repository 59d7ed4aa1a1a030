use crate::error::{Error, Result};
use std::io;

/// Per connection buffer size.
pub const BUFFER_SIZE: usize = 4096;

/// Result of draining a socket into the buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fill {
    /// The reader has no more data for now.
    Drained,
    /// The reader reached end of stream.
    Eof,
    /// The buffer filled up before the reader ran dry.
    Full,
}

/// A fixed-size FIFO byte buffer. Data is appended at the tail and
/// consumed from the head; consuming compacts lazily, so a partial
/// trailing message survives in place until the bytes completing it
/// arrive.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of bytes held.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Discard `count` bytes from the head. The remaining bytes shift
    /// down on the next append that needs the room.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.free_capacity() {
            return Err(Error::BufferOverrun);
        }

        if bytes.len() > self.data.len() - self.tail {
            self.compact();
        }

        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();

        Ok(())
    }

    /// Read from the supplied reader until it runs dry, the stream ends,
    /// or the buffer fills. Returns the bytes read together with the
    /// reason the drain stopped.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, Fill)> {
        let mut total = 0;

        loop {
            if self.free_capacity() == 0 {
                return Ok((total, Fill::Full));
            }

            if self.tail == self.data.len() {
                self.compact();
            }

            match reader.read(&mut self.data[self.tail..]) {
                Ok(0) => return Ok((total, Fill::Eof)),
                Ok(count) => {
                    self.tail += count;
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, Fill::Drained));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write the buffered data to the supplied writer, advancing the head
    /// past whatever was accepted. Stops on `WouldBlock` without error.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while self.head < self.tail {
            match writer.write(&self.data[self.head..self.tail]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Shift the held bytes down to the start of the storage.
    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }

        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
        eof: bool,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
                eof: false,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ingress_until_drained() {
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(data.clone(), 37, 0);
        let mut buffer = Buffer::new(BUFFER_SIZE);

        let (count, fill) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, data.len());
        assert_eq!(fill, Fill::Drained);
        assert_eq!(buffer.read_slice(), &data[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut channel = MockChannel::new(vec![1, 2, 3], 8, 0);
        channel.eof = true;

        let mut buffer = Buffer::new(BUFFER_SIZE);
        let (count, fill) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 3);
        assert_eq!(fill, Fill::Eof);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let data: Vec<u8> = vec![0xAA; 64];
        let mut channel = MockChannel::new(data, 16, 0);
        let mut buffer = Buffer::new(32);

        let (count, fill) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 32);
        assert_eq!(fill, Fill::Full);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_consume_keeps_trailing_bytes() {
        let mut buffer = Buffer::new(32);

        buffer.append(&[1, 2, 3, 4, 5, 6]).unwrap();
        buffer.consume(4);

        assert_eq!(buffer.read_slice(), &[5, 6]);

        // Appending after a consume reuses the freed room.
        buffer.append(&[7, 8]).unwrap();
        assert_eq!(buffer.read_slice(), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_consume_compacts_for_large_append() {
        let mut buffer = Buffer::new(8);

        buffer.append(&[1, 2, 3, 4, 5, 6]).unwrap();
        buffer.consume(5);

        // Only one byte held; six bytes must fit via compaction.
        buffer.append(&[7, 8, 9, 10, 11, 12]).unwrap();
        assert_eq!(buffer.read_slice(), &[6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_append_overrun() {
        let mut buffer = Buffer::new(4);

        buffer.append(&[1, 2, 3]).unwrap();

        assert_eq!(buffer.append(&[4, 5]).err(), Some(Error::BufferOverrun));
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_egress_round_trip() {
        let data: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let mut buffer = Buffer::new(BUFFER_SIZE);
        buffer.append(&data).unwrap();

        let mut channel = MockChannel::new(Vec::new(), 11, usize::max_value());
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data, data);
    }

    #[test]
    fn test_egress_partial_on_would_block() {
        let mut buffer = Buffer::new(BUFFER_SIZE);
        buffer.append(&[0xBB; 50]).unwrap();

        let mut channel = MockChannel::new(Vec::new(), 16, 20);
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, 20);
        assert_eq!(buffer.len(), 30);

        // The remainder goes out once the writer accepts bytes again.
        channel.max_size = usize::max_value();
        let count = buffer.egress(&mut channel).unwrap();
        assert_eq!(count, 30);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_random_chunked_round_trip() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..2000).map(|_| rng.gen()).collect();

        let mut buffer = Buffer::new(256);
        let mut out: Vec<u8> = Vec::new();
        let mut cursor = 0;

        // Interleave appends and consumes with arbitrary chunk sizes; the
        // byte stream must survive untouched.
        while out.len() < data.len() {
            if cursor < data.len() {
                let take = rng
                    .gen_range(1..=64)
                    .min(data.len() - cursor)
                    .min(buffer.free_capacity());
                buffer.append(&data[cursor..cursor + take]).unwrap();
                cursor += take;
            }

            let take = rng.gen_range(1..=48).min(buffer.len());
            out.extend(&buffer.read_slice()[..take]);
            buffer.consume(take);
        }

        assert_eq!(out, data);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroWriter;

        impl io::Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new(8);
        buffer.append(&[1]).unwrap();

        let result = buffer.egress(ZeroWriter);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }
}
