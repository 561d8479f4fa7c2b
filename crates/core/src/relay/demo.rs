use std::io::{self, Read, Seek, SeekFrom, Write};

use super::Frame;

pub const DEMO_MAGIC: u32 = 0x4354_4D44;
pub const DEMO_VERSION: u32 = 2;

/// Ticks between full-baseline frames written by a recording master; a
/// backward seek rescans from the nearest prior baseline.
pub const DEMO_BASELINE_INTERVAL: u32 = 512;

const RECORD_END: u8 = 0;
const RECORD_FRAME: u8 = 1;
const RECORD_BASELINE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("not a demo stream")]
    BadMagic,
    #[error("unsupported demo version {0}")]
    BadVersion(u32),
    #[error("corrupt demo stream: {0}")]
    Corrupt(&'static str),
}

/// Storage source for demo playback.
pub trait DemoSource: Read + Seek {}
impl<T: Read + Seek> DemoSource for T {}

/// Flat byte form of a frame, shared by the demo stream and relay
/// forwarding.
pub fn encode_frame_body(frame: &Frame) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&frame.tick.to_le_bytes());
    body.push(frame.is_full as u8);
    for buffer in frame.buffers() {
        body.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
        body.extend_from_slice(buffer);
    }
    body
}

pub fn decode_frame_body(body: &[u8]) -> Result<Frame, DemoError> {
    let mut cursor = body;
    let tick = read_u32(&mut cursor)?;
    if cursor.is_empty() {
        return Err(DemoError::Corrupt("frame body truncated"));
    }
    let is_full = cursor[0] != 0;
    cursor = &cursor[1..];

    let mut frame = Frame::new(tick);
    frame.is_full = is_full;
    for buffer in frame.buffers_mut() {
        let len = read_u32(&mut cursor)? as usize;
        if cursor.len() < len {
            return Err(DemoError::Corrupt("frame buffer truncated"));
        }
        buffer.extend_from_slice(&cursor[..len]);
        cursor = &cursor[len..];
    }
    Ok(frame)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, DemoError> {
    if cursor.len() < 4 {
        return Err(DemoError::Corrupt("short read"));
    }
    let value = u32::from_le_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
    *cursor = &cursor[4..];
    Ok(value)
}

/// Sequential demo log: a small header followed by zstd-compressed frame
/// records, with periodic full baselines for seekability.
pub struct DemoWriter<W: Write> {
    out: W,
    frames_written: u64,
}

impl<W: Write> DemoWriter<W> {
    pub fn new(mut out: W, start_tick: u32, signon: &[u8]) -> Result<Self, DemoError> {
        out.write_all(&DEMO_MAGIC.to_le_bytes())?;
        out.write_all(&DEMO_VERSION.to_le_bytes())?;
        out.write_all(&start_tick.to_le_bytes())?;
        out.write_all(&(signon.len() as u32).to_le_bytes())?;
        out.write_all(signon)?;
        Ok(Self {
            out,
            frames_written: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), DemoError> {
        let kind = if frame.is_full {
            RECORD_BASELINE
        } else {
            RECORD_FRAME
        };
        let compressed = zstd::encode_all(&encode_frame_body(frame)[..], 0)?;

        self.out.write_all(&[kind])?;
        self.out.write_all(&frame.tick.to_le_bytes())?;
        self.out.write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.out.write_all(&compressed)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn finish(mut self) -> Result<W, DemoError> {
        self.out.write_all(&[RECORD_END])?;
        self.out.write_all(&0u32.to_le_bytes())?;
        self.out.write_all(&0u32.to_le_bytes())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[derive(Debug, Clone)]
pub struct DemoRecord {
    pub tick: u32,
    pub is_baseline: bool,
    pub frame: Frame,
}

/// Forward-sequential demo reader with bounded backward seek: baseline
/// offsets are remembered as they stream past, and `seek_back` rewinds to
/// the nearest one at or before the target tick.
pub struct DemoReader<R: DemoSource> {
    input: R,
    start_tick: u32,
    signon: Vec<u8>,
    data_start: u64,
    baseline_offsets: Vec<(u32, u64)>,
}

impl<R: DemoSource> DemoReader<R> {
    pub fn new(mut input: R) -> Result<Self, DemoError> {
        let mut header = [0u8; 16];
        input.read_exact(&mut header)?;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != DEMO_MAGIC {
            return Err(DemoError::BadMagic);
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != DEMO_VERSION {
            return Err(DemoError::BadVersion(version));
        }
        let start_tick = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let signon_len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;

        let mut signon = vec![0u8; signon_len];
        input.read_exact(&mut signon)?;
        let data_start = input.stream_position()?;

        Ok(Self {
            input,
            start_tick,
            signon,
            data_start,
            baseline_offsets: Vec::new(),
        })
    }

    pub fn start_tick(&self) -> u32 {
        self.start_tick
    }

    pub fn signon(&self) -> &[u8] {
        &self.signon
    }

    /// Next record in stream order, or `None` at the end marker.
    pub fn next(&mut self) -> Result<Option<DemoRecord>, DemoError> {
        let offset = self.input.stream_position()?;

        let mut kind = [0u8; 1];
        self.input.read_exact(&mut kind)?;
        let mut fixed = [0u8; 8];
        self.input.read_exact(&mut fixed)?;
        let tick = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(fixed[4..8].try_into().unwrap()) as usize;

        match kind[0] {
            RECORD_END => Ok(None),
            RECORD_FRAME | RECORD_BASELINE => {
                let is_baseline = kind[0] == RECORD_BASELINE;
                if is_baseline && !self.baseline_offsets.iter().any(|&(t, _)| t == tick) {
                    self.baseline_offsets.push((tick, offset));
                }

                let mut compressed = vec![0u8; len];
                self.input.read_exact(&mut compressed)?;
                let body = zstd::decode_all(&compressed[..])?;
                let frame = decode_frame_body(&body)?;
                if frame.tick != tick {
                    return Err(DemoError::Corrupt("record tick mismatch"));
                }
                Ok(Some(DemoRecord {
                    tick,
                    is_baseline,
                    frame,
                }))
            }
            _ => Err(DemoError::Corrupt("unknown record kind")),
        }
    }

    /// Rewinds to the nearest known baseline at or before `tick` (or the
    /// start of the stream) and returns the tick playback resumes from.
    /// Forward seeking is only possible by reading on.
    pub fn seek_back(&mut self, tick: u32) -> Result<u32, DemoError> {
        let target = self
            .baseline_offsets
            .iter()
            .rev()
            .find(|&&(t, _)| t <= tick)
            .copied();

        match target {
            Some((baseline_tick, offset)) => {
                self.input.seek(SeekFrom::Start(offset))?;
                Ok(baseline_tick)
            }
            None => {
                self.input.seek(SeekFrom::Start(self.data_start))?;
                Ok(self.start_tick)
            }
        }
    }
}
