//! Length-Prefixed Frames
//!
//! ```text
//! +----------------+------------------+
//! | length (4 LE)  | rkyv payload     |
//! +----------------+------------------+
//! ```

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Largest payload accepted in either direction (4 MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

/// Errors from frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed frame payload: {0}")]
    Validation(String),

    #[error("Frame of {size} bytes exceeds limit of {MAX_FRAME_SIZE} bytes")]
    TooLarge { size: usize },

    #[error("Empty frame")]
    Empty,

    #[error("End of stream")]
    EndOfStream,
}

/// Encode one message and flush it
pub fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let payload =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;
    check_size(payload.len())?;

    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Decode one message; a clean EOF before the prefix is `EndOfStream`
pub fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut prefix = [0u8; LEN_PREFIX];
    if let Err(e) = reader.read_exact(&mut prefix) {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => FrameError::EndOfStream,
            _ => FrameError::Io(e),
        });
    }

    let len = u32::from_le_bytes(prefix) as usize;
    check_size(len)?;

    let mut payload = AlignedVec::with_capacity(len);
    payload.resize(len, 0);
    reader.read_exact(&mut payload)?;

    let archived = rkyv::check_archived_root::<T>(&payload)
        .map_err(|e| FrameError::Validation(e.to_string()))?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|e| FrameError::Validation(format!("{:?}", e)))
}

fn check_size(len: usize) -> Result<(), FrameError> {
    if len == 0 {
        Err(FrameError::Empty)
    } else if len > MAX_FRAME_SIZE {
        Err(FrameError::TooLarge { size: len })
    } else {
        Ok(())
    }
}

/// Buffered frame sender
pub struct FrameWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a byte sink
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    /// Send one message
    pub fn send<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.inner, message)
    }
}

/// Buffered frame receiver
pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a byte source
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Receive one message
    pub fn recv<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        read_frame(&mut self.inner)
    }

    /// Whether bytes are already buffered, so a poll on the fd would under-report
    pub fn has_buffered_data(&self) -> bool {
        !self.inner.buffer().is_empty()
    }
}
