use crate::error::{Result, SpeechError};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate of the linear16 audio streamed to clients.
pub const TTS_SAMPLE_RATE: u32 = 24_000;
/// Sample rate the offline recognizer expects.
pub const STT_SAMPLE_RATE: u32 = 16_000;
/// Chunk size used when replaying locally rendered audio.
pub const PSEUDO_STREAM_CHUNK_BYTES: usize = 4096;

const RESAMPLER_CHUNK: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| SpeechError::Resample(e.to_string()))
}

/// Splits samples into fixed-size chunks, zero-padding the last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Resamples mono audio. The output is trimmed to the length implied by the rate ratio.
pub fn resample(samples: &[f32], in_rate: u32, out_rate: u32) -> Result<Vec<f32>> {
    if in_rate == out_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = create_resampler(in_rate as f64, out_rate as f64, RESAMPLER_CHUNK)?;
    let mut out = Vec::with_capacity(samples.len() * out_rate as usize / in_rate as usize + 1);
    for chunk in split_for_chunks(samples, RESAMPLER_CHUNK) {
        let processed = resampler
            .process(&[chunk], None)
            .map_err(|e| SpeechError::Resample(e.to_string()))?;
        if let Some(channel) = processed.into_iter().next() {
            out.extend(channel);
        }
    }

    let expected = (samples.len() as u64 * out_rate as u64 / in_rate as u64) as usize;
    out.truncate(expected);
    Ok(out)
}

/// Averages interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Little-endian PCM16 encoding of audio samples.
pub trait ToBinary {
    fn to_binary(&self) -> Vec<u8>;
}

impl ToBinary for [f32] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter()
            .flat_map(|&sample| {
                let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                v.to_le_bytes()
            })
            .collect()
    }
}

fn is_wav(mime_type: &str) -> bool {
    let lower = mime_type.to_ascii_lowercase();
    lower.contains("wav") || lower.contains("wave")
}

/// Reads a WAV file into mono f32 samples and its sample rate.
pub fn read_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };
    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

/// Writes mono samples as a 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(v)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decodes any container symphonia understands into mono f32 samples and a sample rate.
pub fn decode_with_symphonia(bytes: &[u8], mime_type: &str) -> Result<(Vec<f32>, u32)> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let mut hint = Hint::new();
    hint.mime_type(mime_type);
    if let Some(ext) = mime_type.split('/').nth(1).and_then(|s| s.split(';').next()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| SpeechError::Decode(format!("probe failed: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SpeechError::Decode("no audio track".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| SpeechError::Decode("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| SpeechError::Decode(format!("unsupported codec: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(SpeechError::Decode(format!("read failed: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                tracing::debug!("skipping corrupt packet: {}", e);
                continue;
            }
            Err(e) => return Err(SpeechError::Decode(format!("decode failed: {e}"))),
        };

        let spec = *decoded.spec();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(downmix(buffer.samples(), spec.channels.count()));
    }

    Ok((samples, sample_rate))
}

/// Decodes recorded audio to mono samples. WAV goes through hound, everything else
/// through symphonia.
pub fn decode_to_mono(bytes: &[u8], mime_type: &str) -> Result<(Vec<f32>, u32)> {
    if is_wav(mime_type) {
        read_wav(bytes)
    } else {
        decode_with_symphonia(bytes, mime_type)
    }
}
