//! Recording encoder adapter
//!
//! Picks a container format from a descending-priority candidate list,
//! accumulates bus frames into timed chunks, and finalizes the chunk
//! sequence into a single playable artifact. Chunk sequence numbers are
//! contiguous per session; intervals that captured no audio produce no
//! chunk rather than an empty one.

use std::io::Cursor;

use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::error::Verify;
use flacenc::source::MemSource;

use super::graph::AudioFrame;

#[derive(Debug, Clone)]
pub enum EncoderError {
    NoSupportedEncoding,
    Encode(String),
}

impl std::fmt::Display for EncoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderError::NoSupportedEncoding => {
                write!(f, "No supported recording encoding on this host")
            }
            EncoderError::Encode(e) => write!(f, "Audio encoding failed: {}", e),
        }
    }
}

impl std::error::Error for EncoderError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Flac,
    Wav,
}

/// A candidate container the host may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingCandidate {
    pub mime_type: &'static str,
    pub codec: Codec,
}

/// Probe order. FLAC preferred for size, WAV as the universal fallback.
pub const ENCODING_CANDIDATES: [EncodingCandidate; 2] = [
    EncodingCandidate {
        mime_type: "audio/flac",
        codec: Codec::Flac,
    },
    EncodingCandidate {
        mime_type: "audio/wav",
        codec: Codec::Wav,
    },
];

/// Host capability probe for encoding candidates.
pub trait EncodingSupport: Send + Sync {
    fn is_supported(&self, candidate: &EncodingCandidate) -> bool;
}

/// The built-in encoders; both candidates are always available.
pub struct HostEncodings;

impl EncodingSupport for HostEncodings {
    fn is_supported(&self, _candidate: &EncodingCandidate) -> bool {
        true
    }
}

/// First supported candidate in priority order.
pub fn select_encoding(support: &dyn EncodingSupport) -> Result<EncodingCandidate, EncoderError> {
    ENCODING_CANDIDATES
        .iter()
        .find(|c| support.is_supported(c))
        .copied()
        .ok_or(EncoderError::NoSupportedEncoding)
}

/// One timed slice of the recording. `payload` is interleaved i16 PCM in
/// little-endian byte order.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub captured_at_ms: u64,
}

/// The finalized, playable recording.
#[derive(Debug, Clone)]
pub struct CapturedArtifact {
    pub mime_type: String,
    pub duration_seconds: u32,
    pub payload: Vec<u8>,
}

/// Accumulates frames into chunks for one recording session and finalizes
/// them exactly once.
pub struct ChunkEncoder {
    encoding: EncodingCandidate,
    chunks: Vec<AudioChunk>,
    next_sequence: u32,
    pending: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    paused: bool,
    finalized: bool,
}

impl ChunkEncoder {
    pub fn new(encoding: EncodingCandidate) -> Self {
        Self {
            encoding,
            chunks: Vec::new(),
            next_sequence: 0,
            pending: Vec::new(),
            sample_rate: 0,
            channels: 0,
            paused: false,
            finalized: false,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append a bus frame to the pending chunk. Frames arriving while
    /// paused or after finalize are discarded.
    pub fn ingest_frame(&mut self, frame: &AudioFrame) {
        if self.paused || self.finalized {
            return;
        }
        if self.sample_rate == 0 {
            self.sample_rate = frame.sample_rate;
            self.channels = frame.channels;
        }
        self.pending.extend_from_slice(&frame.samples);
    }

    /// Close the current interval. Emits a chunk only if audio arrived
    /// since the previous cut, keeping the sequence gap-free.
    pub fn cut_chunk(&mut self, at_ms: u64) -> Option<&AudioChunk> {
        if self.finalized || self.pending.is_empty() {
            return None;
        }
        let mut payload = Vec::with_capacity(self.pending.len() * 2);
        for sample in self.pending.drain(..) {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        let chunk = AudioChunk {
            sequence: self.next_sequence,
            payload,
            captured_at_ms: at_ms,
        };
        self.next_sequence += 1;
        self.chunks.push(chunk);
        self.chunks.last()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Finalize the session into a playable artifact. The first call wins;
    /// later calls return `Ok(None)` and the chunk state is left sealed.
    /// A session that captured no audio still yields a valid artifact with
    /// an empty payload and zero duration.
    pub fn finalize(
        &mut self,
        duration_seconds: u32,
        final_cut_at_ms: u64,
    ) -> Result<Option<CapturedArtifact>, EncoderError> {
        if self.finalized {
            return Ok(None);
        }
        self.cut_chunk(final_cut_at_ms);
        self.finalized = true;

        let total_bytes: usize = self.chunks.iter().map(|c| c.payload.len()).sum();
        if total_bytes == 0 {
            log::info!("Finalizing empty session as zero-length artifact");
            return Ok(Some(CapturedArtifact {
                mime_type: self.encoding.mime_type.to_string(),
                duration_seconds: 0,
                payload: Vec::new(),
            }));
        }

        let mut samples = Vec::with_capacity(total_bytes / 2);
        for chunk in &self.chunks {
            for pair in chunk.payload.chunks_exact(2) {
                samples.push(i16::from_le_bytes([pair[0], pair[1]]));
            }
        }

        let payload = match self.encoding.codec {
            Codec::Wav => encode_wav(&samples, self.sample_rate, self.channels)?,
            Codec::Flac => encode_flac(&samples, self.sample_rate, self.channels)?,
        };

        log::info!(
            "Finalized recording: {} chunks, {} samples, {} bytes {}",
            self.chunks.len(),
            samples.len(),
            payload.len(),
            self.encoding.mime_type
        );

        Ok(Some(CapturedArtifact {
            mime_type: self.encoding.mime_type.to_string(),
            duration_seconds,
            payload,
        }))
    }
}

fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>, EncoderError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| EncoderError::Encode(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| EncoderError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| EncoderError::Encode(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

fn encode_flac(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>, EncoderError> {
    let samples_i32: Vec<i32> = samples.iter().map(|&s| s as i32).collect();

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|(_, e)| EncoderError::Encode(format!("{:?}", e)))?;

    let source = MemSource::from_samples(
        &samples_i32,
        channels as usize,
        16,
        sample_rate as usize,
    );

    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| EncoderError::Encode(format!("{:?}", e)))?;

    let mut sink = ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| EncoderError::Encode(e.to_string()))?;

    Ok(sink.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSupport(Vec<&'static str>);

    impl EncodingSupport for FixedSupport {
        fn is_supported(&self, candidate: &EncodingCandidate) -> bool {
            self.0.contains(&candidate.mime_type)
        }
    }

    fn frame(samples: Vec<i16>, at_ms: u64) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 48_000,
            channels: 1,
            captured_at_ms: at_ms,
        }
    }

    #[test]
    fn selection_prefers_flac() {
        let support = FixedSupport(vec!["audio/flac", "audio/wav"]);
        assert_eq!(select_encoding(&support).unwrap().codec, Codec::Flac);
    }

    #[test]
    fn selection_falls_back_to_wav() {
        let support = FixedSupport(vec!["audio/wav"]);
        assert_eq!(select_encoding(&support).unwrap().codec, Codec::Wav);
    }

    #[test]
    fn no_candidate_supported_is_an_error() {
        let support = FixedSupport(vec![]);
        assert!(matches!(
            select_encoding(&support),
            Err(EncoderError::NoSupportedEncoding)
        ));
    }

    #[test]
    fn silent_intervals_do_not_break_the_sequence() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[1]);
        enc.ingest_frame(&frame(vec![1, 2], 10));
        assert!(enc.cut_chunk(1000).is_some());
        // Nothing arrives in the second interval.
        assert!(enc.cut_chunk(2000).is_none());
        enc.ingest_frame(&frame(vec![3], 2500));
        let chunk = enc.cut_chunk(3000).unwrap();
        assert_eq!(chunk.sequence, 1);
        assert_eq!(enc.chunk_count(), 2);
    }

    #[test]
    fn paused_frames_are_discarded() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[1]);
        enc.pause();
        enc.ingest_frame(&frame(vec![5; 100], 10));
        assert!(enc.cut_chunk(1000).is_none());
        enc.resume();
        enc.ingest_frame(&frame(vec![5; 100], 1100));
        assert!(enc.cut_chunk(2000).is_some());
    }

    #[test]
    fn finalize_is_exactly_once() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[1]);
        enc.ingest_frame(&frame(vec![7; 480], 10));
        let first = enc.finalize(1, 1000).unwrap();
        assert!(first.is_some());
        let second = enc.finalize(1, 1000).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn empty_session_finalizes_to_zero_length_artifact() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[0]);
        let artifact = enc.finalize(5, 100).unwrap().unwrap();
        assert_eq!(artifact.duration_seconds, 0);
        assert!(artifact.payload.is_empty());
        assert_eq!(artifact.mime_type, "audio/flac");
    }

    #[test]
    fn wav_artifact_has_riff_header() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[1]);
        enc.ingest_frame(&frame(vec![0; 4800], 10));
        let artifact = enc.finalize(1, 1000).unwrap().unwrap();
        assert_eq!(&artifact.payload[0..4], b"RIFF");
        assert_eq!(artifact.mime_type, "audio/wav");
        assert_eq!(artifact.duration_seconds, 1);
    }

    #[test]
    fn flac_artifact_has_flac_magic() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[0]);
        enc.ingest_frame(&frame(vec![0; 4800], 10));
        let artifact = enc.finalize(1, 1000).unwrap().unwrap();
        assert_eq!(&artifact.payload[0..4], b"fLaC");
    }

    #[test]
    fn finalize_includes_the_trailing_partial_chunk() {
        let mut enc = ChunkEncoder::new(ENCODING_CANDIDATES[1]);
        enc.ingest_frame(&frame(vec![1; 100], 10));
        enc.cut_chunk(1000);
        enc.ingest_frame(&frame(vec![2; 50], 1500));
        enc.finalize(2, 1600).unwrap().unwrap();
        assert_eq!(enc.chunk_count(), 2);
    }
}
