//! Bounded value streams between a producer and a consumer thread
//!
//! Values move in chunks over a `sync_channel`; a full channel blocks the
//! producer, so a slow consumer throttles the writer instead of the whole
//! value being buffered.
//!
//! A stream ends either with an explicit `finish` (clean end), a `fail`
//! carrying the producer's error, or the producer being dropped (the
//! consumer then sees `Interrupted`).

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use tessera_core::{Error, Result};

enum Message {
    Chunk(Vec<u8>),
    End,
    Failed(Error),
}

/// Create a stream whose producer emits `chunk_size`-byte chunks and may run
/// at most `capacity` chunks ahead of the consumer.
pub fn value_stream(chunk_size: usize, capacity: usize) -> (ValueSink, ValueSource) {
    let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
    (
        ValueSink {
            sender: Some(sender),
            buffer: Vec::with_capacity(chunk_size.max(1)),
            chunk_size: chunk_size.max(1),
            written: 0,
        },
        ValueSource {
            receiver,
            finished: false,
        },
    )
}

/// Producer side of a value stream.
pub struct ValueSink {
    sender: Option<SyncSender<Message>>,
    buffer: Vec<u8>,
    chunk_size: usize,
    written: u64,
}

impl ValueSink {
    fn send(&mut self, message: Message) -> Result<()> {
        let sent = match &self.sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        };
        if !sent {
            self.sender = None;
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        self.send(Message::Chunk(chunk))
    }

    /// Append bytes, blocking while the consumer is `capacity` chunks behind.
    ///
    /// Fails with `Interrupted` once the consumer is gone.
    pub fn push(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.written += take as u64;
            if self.buffer.len() == self.chunk_size {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    /// Bytes pushed so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// End the stream cleanly.
    pub fn finish(mut self) -> Result<()> {
        self.flush_chunk()?;
        self.send(Message::End)?;
        self.sender = None;
        Ok(())
    }

    /// End the stream with `error`, which the consumer receives as is.
    pub fn fail(mut self, error: Error) {
        self.buffer.clear();
        let _ = self.send(Message::Failed(error));
        self.sender = None;
    }
}

impl Write for ValueSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_chunk()
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

/// Consumer side of a value stream, chunk by chunk.
pub struct ValueSource {
    receiver: Receiver<Message>,
    finished: bool,
}

impl ValueSource {
    /// Next chunk, or `None` after a clean end.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(Message::Chunk(chunk)) => Ok(Some(chunk)),
            Ok(Message::End) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Message::Failed(error)) => {
                self.finished = true;
                Err(error)
            }
            Err(_) => {
                self.finished = true;
                Err(Error::Interrupted)
            }
        }
    }

    /// Collect the rest of the stream
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut value = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            value.extend_from_slice(&chunk);
        }
        Ok(value)
    }

    /// Byte-oriented reader over the rest of the stream
    pub fn into_reader(self) -> ValueReader {
        ValueReader {
            source: self,
            current: Vec::new(),
            position: 0,
        }
    }
}

/// `std::io::Read` adapter over a value stream.
pub struct ValueReader {
    source: ValueSource,
    current: Vec<u8>,
    position: usize,
}

impl Read for ValueReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position == self.current.len() {
            match self.source.next_chunk() {
                Ok(Some(chunk)) => {
                    self.current = chunk;
                    self.position = 0;
                }
                Ok(None) => return Ok(0),
                Err(Error::IoError(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            }
        }
        let n = buf.len().min(self.current.len() - self.position);
        buf[..n].copy_from_slice(&self.current[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}
