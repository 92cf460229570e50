//! Persisted capture stream
//!
//! A recording is one zlib stream holding a header followed by captured
//! buffers, every field big-endian:
//!
//! ```text
//! i32 magic            0x534F4E52 ("SONR")
//! i32 version
//! f32 sample_rate
//! i32 sample_count     interleaved samples per buffer
//! i32 resolution_width
//! i32 resolution_height
//! i32 operator_len
//! f32 operator[operator_len]
//! i16 samples[sample_count]   repeated until end of stream
//! ```
//!
//! [`StreamWriter`] records from inside a filter chain, [`StreamReader`]
//! reads buffers back and loops at the end, and [`ReplaySource`] turns a
//! reader into an [`AudioInput`] so a recording can drive the live pipeline.

use crate::audio::{AudioError, AudioInput};
use crate::controller::Rect;
use crate::dsp::pulse::PulseOperator;
use crate::filter::{FilterError, SignalFilter};
use crate::frame::Frame;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Stream identifier, "SONR"
pub const MAGIC: i32 = 0x534F_4E52;

/// Current stream layout version
pub const VERSION: i32 = 2;

/// Errors reading or writing a recording
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Not a sonar recording (magic {found:#010x})")]
    BadMagic { found: i32 },

    #[error("Unsupported recording version {0}")]
    UnsupportedVersion(i32),

    #[error("Corrupt recording: {0}")]
    Corrupt(String),

    #[error("Recording holds no frames")]
    Empty,

    #[error("Recording is closed")]
    Closed,
}

/// Session parameters stored once at the start of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHeader {
    pub sample_rate: f32,
    /// Interleaved samples per buffer
    pub sample_count: usize,
    pub resolution: Rect,
    pub operator: PulseOperator,
}

impl StreamHeader {
    /// Header describing the buffers `frame` carries
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            sample_rate: frame.sample_rate,
            sample_count: frame.samples.len(),
            resolution: Rect::sized(frame.resolution.width(), frame.resolution.height()),
            operator: frame.operator.clone(),
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&MAGIC.to_be_bytes())?;
        w.write_all(&VERSION.to_be_bytes())?;
        w.write_all(&self.sample_rate.to_be_bytes())?;
        w.write_all(&(self.sample_count as i32).to_be_bytes())?;
        w.write_all(&self.resolution.width().to_be_bytes())?;
        w.write_all(&self.resolution.height().to_be_bytes())?;
        w.write_all(&(self.operator.len() as i32).to_be_bytes())?;
        let operator: Vec<u8> = self.operator.iter().flat_map(|x| x.to_be_bytes()).collect();
        w.write_all(&operator)
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self, RecordingError> {
        let magic = match read_i32(r) {
            Ok(magic) => magic,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(RecordingError::Empty)
            }
            Err(e) => return Err(e.into()),
        };
        if magic != MAGIC {
            return Err(RecordingError::BadMagic { found: magic });
        }
        let version = read_i32(r)?;
        if version != VERSION {
            return Err(RecordingError::UnsupportedVersion(version));
        }

        let sample_rate = f32::from_be_bytes(read_array(r)?);
        let sample_count = read_i32(r)?;
        let width = read_i32(r)?;
        let height = read_i32(r)?;
        let operator_len = read_i32(r)?;

        if !(sample_rate > 0.0) {
            return Err(RecordingError::Corrupt(format!("sample rate {}", sample_rate)));
        }
        if sample_count <= 0 || sample_count % 2 != 0 {
            return Err(RecordingError::Corrupt(format!("sample count {}", sample_count)));
        }
        if width < 0 || height < 0 {
            return Err(RecordingError::Corrupt(format!("resolution {}x{}", width, height)));
        }
        if operator_len < 0 || operator_len > sample_count / 2 {
            return Err(RecordingError::Corrupt(format!("operator length {}", operator_len)));
        }

        let mut bytes = vec![0u8; operator_len as usize * 4];
        r.read_exact(&mut bytes)?;
        let operator = bytes
            .chunks_exact(4)
            .map(|b| f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self {
            sample_rate,
            sample_count: sample_count as usize,
            resolution: Rect::sized(width, height),
            operator: PulseOperator::from_samples(operator),
        })
    }
}

fn read_array<R: Read>(r: &mut R) -> io::Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    read_array(r).map(i32::from_be_bytes)
}

struct WriterState<W: Write> {
    encoder: ZlibEncoder<W>,
    header: Option<StreamHeader>,
    bytes: Vec<u8>,
    frames: u64,
}

/// Filter that appends every frame's samples to a recording
///
/// The header is taken from the first frame. Later frames must carry the
/// same number of samples.
pub struct StreamWriter<W: Write + Send> {
    state: Mutex<Option<WriterState<W>>>,
}

impl StreamWriter<BufWriter<File>> {
    /// Create (or truncate) a recording file
    pub fn create(path: &Path) -> Result<Self, RecordingError> {
        let file = File::create(path)?;
        tracing::info!(path = %path.display(), "Recording to file");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(Some(WriterState {
                encoder: ZlibEncoder::new(writer, Compression::default()),
                header: None,
                bytes: Vec::new(),
                frames: 0,
            })),
        }
    }

    /// Frames written so far
    pub fn frames(&self) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.frames))
            .unwrap_or(0)
    }

    /// Finish the stream and hand back the underlying writer
    ///
    /// Returns `None` if the writer was already closed.
    pub fn close(&self) -> Result<Option<W>, RecordingError> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(state) = state else {
            return Ok(None);
        };
        let mut writer = state.encoder.finish()?;
        writer.flush()?;
        tracing::info!(frames = state.frames, "Recording closed");
        Ok(Some(writer))
    }

    fn write_frame(state: &mut WriterState<W>, frame: &Frame) -> Result<(), RecordingError> {
        match &state.header {
            Some(header) => {
                if header.sample_count != frame.samples.len() {
                    return Err(RecordingError::Corrupt(format!(
                        "frame of {} samples in a stream of {}",
                        frame.samples.len(),
                        header.sample_count
                    )));
                }
            }
            None => {
                let header = StreamHeader::from_frame(frame);
                header.write_to(&mut state.encoder)?;
                tracing::debug!(
                    sample_count = header.sample_count,
                    operator_len = header.operator.len(),
                    "Recording header written"
                );
                state.header = Some(header);
            }
        }

        state.bytes.clear();
        state
            .bytes
            .extend(frame.samples.iter().flat_map(|s| s.to_be_bytes()));
        state.encoder.write_all(&state.bytes)?;
        state.frames += 1;
        Ok(())
    }
}

impl<W: Write + Send> SignalFilter for StreamWriter<W> {
    fn accept(&self, frame: &mut Frame) -> Result<(), FilterError> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = guard.as_mut().ok_or(RecordingError::Closed)?;
        Self::write_frame(state, frame)?;
        Ok(())
    }
}

impl<W: Write + Send> std::fmt::Debug for StreamWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("frames", &self.frames())
            .finish()
    }
}

/// Sequential reader over a recording, looping at the end
pub struct StreamReader<R: Read + Seek> {
    decoder: Option<ZlibDecoder<R>>,
    header: StreamHeader,
    start: u64,
    bytes: Vec<u8>,
    samples: Vec<i16>,
    frames: u64,
    rewinds: u64,
}

impl StreamReader<BufReader<File>> {
    /// Open a recording file
    pub fn open_path(path: &Path) -> Result<Self, RecordingError> {
        let file = File::open(path)?;
        Self::open(BufReader::new(file))
    }
}

impl<R: Read + Seek> StreamReader<R> {
    /// Read and validate the header at the reader's current position
    ///
    /// # Errors
    /// [`RecordingError::BadMagic`] and [`RecordingError::UnsupportedVersion`]
    /// for foreign or newer streams, [`RecordingError::Empty`] for an empty one.
    pub fn open(mut reader: R) -> Result<Self, RecordingError> {
        let start = reader.stream_position()?;
        let mut decoder = ZlibDecoder::new(reader);
        let header = StreamHeader::read_from(&mut decoder)?;
        tracing::info!(
            sample_rate = header.sample_rate,
            sample_count = header.sample_count,
            operator_len = header.operator.len(),
            "Recording opened"
        );
        Ok(Self {
            decoder: Some(decoder),
            bytes: vec![0; header.sample_count * 2],
            samples: vec![0; header.sample_count],
            header,
            start,
            frames: 0,
            rewinds: 0,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Buffers returned so far, across rewinds
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Times the reader went back to the start
    pub fn rewinds(&self) -> u64 {
        self.rewinds
    }

    /// Next buffer, or `None` at the end of the stream
    ///
    /// A trailing partial buffer counts as the end.
    pub fn next_frame(&mut self) -> Result<Option<&[i16]>, RecordingError> {
        if self.fill()? {
            Ok(Some(self.samples.as_slice()))
        } else {
            Ok(None)
        }
    }

    /// Next buffer, starting over from the header at the end of the stream
    pub fn read_frame(&mut self) -> Result<&[i16], RecordingError> {
        if !self.fill()? {
            self.rewind()?;
            if !self.fill()? {
                return Err(RecordingError::Empty);
            }
        }
        Ok(self.samples.as_slice())
    }

    fn fill(&mut self) -> Result<bool, RecordingError> {
        let decoder = self.decoder.as_mut().ok_or(RecordingError::Closed)?;
        match decoder.read_exact(&mut self.bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        for (sample, b) in self.samples.iter_mut().zip(self.bytes.chunks_exact(2)) {
            *sample = i16::from_be_bytes([b[0], b[1]]);
        }
        self.frames += 1;
        Ok(true)
    }

    fn rewind(&mut self) -> Result<(), RecordingError> {
        let decoder = self.decoder.take().ok_or(RecordingError::Closed)?;
        let mut reader = decoder.into_inner();
        reader.seek(SeekFrom::Start(self.start))?;

        let mut decoder = ZlibDecoder::new(reader);
        let header = StreamHeader::read_from(&mut decoder)?;
        if header != self.header {
            return Err(RecordingError::Corrupt("header changed on rewind".into()));
        }
        self.decoder = Some(decoder);
        self.rewinds += 1;
        tracing::debug!(rewinds = self.rewinds, "Recording rewound");
        Ok(())
    }
}

/// A recording played back as if it were the microphones
///
/// Recorded buffers overlap by one operator length, so after the first
/// buffer only the new part of each one is emitted. Fed through the capture
/// loop, this reproduces the recorded buffers exactly. One buffer is
/// released per `interval`; in between, reads return nothing.
pub struct ReplaySource<R: Read + Seek> {
    reader: StreamReader<R>,
    interval: Duration,
    pending: Vec<i16>,
    offset: usize,
    next_due: Option<Instant>,
}

impl<R: Read + Seek> ReplaySource<R> {
    pub fn new(reader: StreamReader<R>, interval: Duration) -> Self {
        Self {
            reader,
            interval,
            pending: Vec::new(),
            offset: 0,
            next_due: None,
        }
    }

    pub fn header(&self) -> &StreamHeader {
        self.reader.header()
    }

    fn refill(&mut self) -> Result<bool, RecordingError> {
        let now = Instant::now();
        if self.next_due.is_some_and(|due| now < due) {
            return Ok(false);
        }
        let overlap = if self.next_due.is_none() {
            0
        } else {
            self.reader.header().operator.len() * 2
        };
        let frame = self.reader.read_frame()?;
        self.pending.clear();
        self.pending.extend_from_slice(&frame[overlap.min(frame.len())..]);
        self.offset = 0;
        self.next_due = Some(now + self.interval);
        Ok(true)
    }
}

impl<R: Read + Seek + Send> AudioInput for ReplaySource<R> {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.offset >= self.pending.len() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => return Err(AudioError::Stream(format!("recording: {}", e))),
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(values: &[i16]) -> Frame {
        let mut frame = Frame::new(
            48000.0,
            PulseOperator::from_samples(vec![0.25, -0.5]),
            values.len(),
        );
        frame.resolution = Rect::sized(8, 4);
        frame.samples.copy_from_slice(values);
        frame
    }

    fn record(frames: &[&[i16]]) -> Vec<u8> {
        let writer = StreamWriter::new(Vec::new());
        for values in frames {
            writer.accept(&mut frame(values)).unwrap();
        }
        writer.close().unwrap().unwrap()
    }

    fn raw(header: impl FnOnce(&mut Vec<u8>)) -> Cursor<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        let mut bytes = Vec::new();
        header(&mut bytes);
        encoder.write_all(&bytes).unwrap();
        Cursor::new(encoder.finish().unwrap())
    }

    #[test]
    fn test_header_and_frames_read_back() {
        let data = record(&[&[1, -2, 3, -4, 5, -6, 7, -8], &[9, 10, 11, 12, 13, 14, 15, 16]]);
        let mut reader = StreamReader::open(Cursor::new(data)).unwrap();

        let header = reader.header().clone();
        assert_eq!(header.sample_rate, 48000.0);
        assert_eq!(header.sample_count, 8);
        assert_eq!(header.resolution, Rect::sized(8, 4));
        assert_eq!(header.operator.samples(), &[0.25, -0.5]);

        assert_eq!(reader.next_frame().unwrap().unwrap(), &[1, -2, 3, -4, 5, -6, 7, -8]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), &[9, 10, 11, 12, 13, 14, 15, 16]);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_read_frame_rewinds_at_end() {
        let data = record(&[&[1, 1, 1, 1], &[2, 2, 2, 2]]);
        let mut reader = StreamReader::open(Cursor::new(data)).unwrap();

        let firsts: Vec<i16> = (0..5).map(|_| reader.read_frame().unwrap()[0]).collect();
        assert_eq!(firsts, vec![1, 2, 1, 2, 1]);
        assert_eq!(reader.rewinds(), 2);
        assert_eq!(reader.frames(), 5);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let cursor = raw(|b| {
            b.extend_from_slice(&0x1234_5678i32.to_be_bytes());
            b.extend_from_slice(&VERSION.to_be_bytes());
        });
        assert!(matches!(
            StreamReader::open(cursor),
            Err(RecordingError::BadMagic { found: 0x1234_5678 })
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let cursor = raw(|b| {
            b.extend_from_slice(&MAGIC.to_be_bytes());
            b.extend_from_slice(&7i32.to_be_bytes());
        });
        assert!(matches!(
            StreamReader::open(cursor),
            Err(RecordingError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_odd_sample_count_is_corrupt() {
        let cursor = raw(|b| {
            b.extend_from_slice(&MAGIC.to_be_bytes());
            b.extend_from_slice(&VERSION.to_be_bytes());
            b.extend_from_slice(&48000.0f32.to_be_bytes());
            b.extend_from_slice(&7i32.to_be_bytes());
            b.extend_from_slice(&[0; 12]);
        });
        assert!(matches!(
            StreamReader::open(cursor),
            Err(RecordingError::Corrupt(_))
        ));
    }

    #[test]
    fn test_header_only_stream_has_no_frames() {
        let header = StreamHeader::from_frame(&frame(&[0; 4]));
        let cursor = raw(|b| header.write_to(b).unwrap());
        let mut reader = StreamReader::open(cursor).unwrap();
        assert!(matches!(reader.read_frame(), Err(RecordingError::Empty)));
        assert!(matches!(
            StreamReader::open(Cursor::new(Vec::new())),
            Err(RecordingError::Io(_)) | Err(RecordingError::Empty)
        ));
    }

    #[test]
    fn test_partial_trailing_frame_discarded() {
        let header = StreamHeader::from_frame(&frame(&[0; 4]));
        let cursor = raw(|b| {
            header.write_to(b).unwrap();
            for s in [5i16, 6, 7, 8, 9, 10] {
                b.extend_from_slice(&s.to_be_bytes());
            }
        });
        let mut reader = StreamReader::open(cursor).unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap(), &[5, 6, 7, 8]);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_writer_rejects_resized_and_closed() {
        let writer = StreamWriter::new(Vec::new());
        writer.accept(&mut frame(&[0; 4])).unwrap();
        assert!(matches!(
            writer.accept(&mut frame(&[0; 6])),
            Err(FilterError::Recording(RecordingError::Corrupt(_)))
        ));
        assert_eq!(writer.frames(), 1);

        assert!(writer.close().unwrap().is_some());
        assert!(writer.close().unwrap().is_none());
        assert!(matches!(
            writer.accept(&mut frame(&[0; 4])),
            Err(FilterError::Recording(RecordingError::Closed))
        ));
    }

    #[test]
    fn test_replay_skips_overlap_after_first_frame() {
        // Operator of 2 frames, so 4 interleaved samples of overlap
        let data = record(&[&[1, 2, 3, 4, 5, 6, 7, 8], &[5, 6, 7, 8, 9, 10, 11, 12]]);
        let reader = StreamReader::open(Cursor::new(data)).unwrap();
        let mut source = ReplaySource::new(reader, Duration::ZERO);

        let mut out = Vec::new();
        let mut buf = [0i16; 3];
        while out.len() < 12 {
            let n = source.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_replay_is_paced() {
        let data = record(&[&[1, 2, 3, 4]]);
        let reader = StreamReader::open(Cursor::new(data)).unwrap();
        let mut source = ReplaySource::new(reader, Duration::from_secs(60));

        let mut buf = [0i16; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }
}
