//! # Audio Format Adapter
//!
//! Pure, stateless conversions between the audio representations used by the capture
//! engine, the playback engine and the wire.
//!
//! ## Key Functions:
//! - **resample**: linear-interpolation sample-rate conversion
//! - **to_mulaw / from_mulaw**: G.711 mu-law companding (bias 33, 0x1FFF clip)
//! - **to_alaw / from_alaw**: G.711 A-law companding
//! - **downmix_stereo_to_mono**: rounded mean of interleaved L/R samples
//! - **convert_bit_depth**: 16 <-> 24 bit little-endian PCM
//!
//! ## Buffer Contract:
//! Every function validates the byte length against the sample stride up front and
//! returns [`FormatError::MisalignedBuffer`] instead of failing midway. Callers running
//! in a hot loop should call [`validate_stride`] once at the edge and only pass
//! aligned buffers afterwards.

use crate::audio::frame::{AudioCodec, WireFormat};
use crate::error::FormatError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

const MULAW_BIAS: i32 = 33;
const MULAW_MAX: i32 = 0x1FFF;

/// Upper bounds of the eight A-law segments in the 13-bit domain.
const ALAW_SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Check that `buffer` holds a whole number of `stride`-byte samples.
pub fn validate_stride(buffer: &[u8], stride: usize) -> Result<(), FormatError> {
    if stride == 0 || buffer.len() % stride != 0 {
        return Err(FormatError::MisalignedBuffer {
            len: buffer.len(),
            stride,
        });
    }
    Ok(())
}

/// Decode little-endian PCM16 bytes into samples.
pub fn bytes_to_samples(buffer: &[u8]) -> Result<Vec<i16>, FormatError> {
    validate_stride(buffer, 2)?;
    let mut cursor = Cursor::new(buffer);
    let mut samples = Vec::with_capacity(buffer.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode samples as little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Resample mono PCM16 bytes from `from_rate` to `to_rate`.
///
/// Identity (byte-for-byte copy) when the rates match.
pub fn resample(buffer: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, FormatError> {
    validate_stride(buffer, 2)?;
    if from_rate == to_rate {
        check_rate(from_rate)?;
        return Ok(buffer.to_vec());
    }
    let samples = bytes_to_samples(buffer)?;
    Ok(samples_to_bytes(&resample_samples(&samples, from_rate, to_rate)?))
}

/// Sample-level linear-interpolation resampler behind [`resample`].
///
/// ## Algorithm:
/// Output sample `i` sits at source position `i * from / to`. Its value interpolates
/// between the two neighbouring source samples and is rounded to the nearest integer.
/// The position is computed from the integer index on every step, so no error
/// accumulates and the result depends only on the inputs.
pub fn resample_samples(samples: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>, FormatError> {
    check_rate(from_rate)?;
    check_rate(to_rate)?;
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let last = samples.len() - 1;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let numerator = i as u64 * from_rate as u64;
        let index = (numerator / to_rate as u64) as usize;
        let fraction = (numerator % to_rate as u64) as f64 / to_rate as f64;

        let current = samples[index.min(last)] as f64;
        let next = samples[(index + 1).min(last)] as f64;
        let value = current + (next - current) * fraction;
        output.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    Ok(output)
}

fn check_rate(rate: u32) -> Result<(), FormatError> {
    if rate == 0 {
        return Err(FormatError::InvalidSampleRate(rate));
    }
    Ok(())
}

/// Encode one 16-bit sample as mu-law.
///
/// The sample is narrowed to the codec's 14-bit domain, biased by 33, clipped at
/// 0x1FFF and split into a 3-bit exponent and 4-bit mantissa. The output byte is
/// inverted, as G.711 requires.
pub fn mulaw_encode_sample(sample: i16) -> u8 {
    let mut magnitude = (sample as i32) >> 2;
    let mut sign = 0u8;
    if magnitude < 0 {
        magnitude = -magnitude;
        sign = 0x80;
    }
    magnitude = (magnitude + MULAW_BIAS).min(MULAW_MAX);

    let mut position: i32 = 12;
    let mut mask: i32 = 0x1000;
    while magnitude & mask != mask && position >= 5 {
        mask >>= 1;
        position -= 1;
    }
    let mantissa = ((magnitude >> (position - 4)) & 0x0F) as u8;
    let exponent = (position - 5) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode one mu-law byte to a 16-bit sample.
pub fn mulaw_decode_sample(byte: u8) -> i16 {
    let value = !byte;
    let negative = value & 0x80 != 0;
    let position = (((value & 0x70) >> 4) + 5) as i32;
    let mantissa = (value & 0x0F) as i32;
    let decoded = ((1 << position) | (mantissa << (position - 4)) | (1 << (position - 5))) - MULAW_BIAS;
    let decoded = if negative { -decoded } else { decoded };
    (decoded << 2) as i16
}

/// Encode one 16-bit sample as A-law.
pub fn alaw_encode_sample(sample: i16) -> u8 {
    let mut value = (sample as i32) >> 3;
    let mask: u8 = if value >= 0 {
        0xD5
    } else {
        value = -value - 1;
        0x55
    };

    let segment = ALAW_SEGMENT_END
        .iter()
        .position(|&end| value <= end)
        .unwrap_or(ALAW_SEGMENT_END.len());
    if segment >= ALAW_SEGMENT_END.len() {
        return 0x7F ^ mask;
    }

    let mut encoded = (segment as u8) << 4;
    encoded |= if segment < 2 {
        ((value >> 1) & 0x0F) as u8
    } else {
        ((value >> segment) & 0x0F) as u8
    };
    encoded ^ mask
}

/// Decode one A-law byte to a 16-bit sample.
pub fn alaw_decode_sample(byte: u8) -> i16 {
    let value = byte ^ 0x55;
    let mut magnitude = ((value & 0x0F) as i32) << 4;
    let segment = ((value & 0x70) >> 4) as i32;
    match segment {
        0 => magnitude += 8,
        1 => magnitude += 0x108,
        _ => {
            magnitude += 0x108;
            magnitude <<= segment - 1;
        }
    }
    if value & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Convert PCM16 bytes to mu-law bytes (one byte per sample).
pub fn to_mulaw(buffer: &[u8]) -> Result<Vec<u8>, FormatError> {
    validate_stride(buffer, 2)?;
    Ok(buffer
        .chunks_exact(2)
        .map(|pair| mulaw_encode_sample(LittleEndian::read_i16(pair)))
        .collect())
}

/// Convert mu-law bytes to PCM16 bytes.
pub fn from_mulaw(buffer: &[u8]) -> Result<Vec<u8>, FormatError> {
    let samples: Vec<i16> = buffer.iter().map(|&b| mulaw_decode_sample(b)).collect();
    Ok(samples_to_bytes(&samples))
}

/// Convert PCM16 bytes to A-law bytes.
pub fn to_alaw(buffer: &[u8]) -> Result<Vec<u8>, FormatError> {
    validate_stride(buffer, 2)?;
    Ok(buffer
        .chunks_exact(2)
        .map(|pair| alaw_encode_sample(LittleEndian::read_i16(pair)))
        .collect())
}

/// Convert A-law bytes to PCM16 bytes.
pub fn from_alaw(buffer: &[u8]) -> Result<Vec<u8>, FormatError> {
    let samples: Vec<i16> = buffer.iter().map(|&b| alaw_decode_sample(b)).collect();
    Ok(samples_to_bytes(&samples))
}

/// Average interleaved stereo PCM16 into mono, rounding to the nearest integer.
pub fn downmix_stereo_to_mono(buffer: &[u8]) -> Result<Vec<u8>, FormatError> {
    validate_stride(buffer, 4)?;
    let samples = bytes_to_samples(buffer)?;
    Ok(samples_to_bytes(&downmix_samples(&samples)))
}

pub(crate) fn downmix_samples(interleaved: &[i16]) -> Vec<i16> {
    interleaved
        .chunks_exact(2)
        .map(|lr| ((lr[0] as f64 + lr[1] as f64) / 2.0).round() as i16)
        .collect()
}

/// Widen or narrow little-endian PCM between 16 and 24 bits per sample.
///
/// Widening shifts left by 8 bits; narrowing drops the low byte (arithmetic shift).
pub fn convert_bit_depth(buffer: &[u8], from_bits: u16, to_bits: u16) -> Result<Vec<u8>, FormatError> {
    let from_stride = bit_depth_stride(from_bits)?;
    bit_depth_stride(to_bits)?;
    validate_stride(buffer, from_stride)?;

    match (from_bits, to_bits) {
        (a, b) if a == b => Ok(buffer.to_vec()),
        (16, 24) => {
            let mut output = vec![0u8; buffer.len() / 2 * 3];
            for (pair, out) in buffer.chunks_exact(2).zip(output.chunks_exact_mut(3)) {
                let widened = (LittleEndian::read_i16(pair) as i32) << 8;
                LittleEndian::write_i24(out, widened);
            }
            Ok(output)
        }
        (24, 16) => {
            let mut output = vec![0u8; buffer.len() / 3 * 2];
            for (triple, out) in buffer.chunks_exact(3).zip(output.chunks_exact_mut(2)) {
                let narrowed = (LittleEndian::read_i24(triple) >> 8) as i16;
                LittleEndian::write_i16(out, narrowed);
            }
            Ok(output)
        }
        (_, other) => Err(FormatError::UnsupportedBitDepth(other)),
    }
}

fn bit_depth_stride(bits: u16) -> Result<usize, FormatError> {
    match bits {
        16 => Ok(2),
        24 => Ok(3),
        other => Err(FormatError::UnsupportedBitDepth(other)),
    }
}

/// Convert captured samples into the encoded bytes of a wire format.
///
/// ## Pipeline:
/// 1. Downmix to mono when the source is stereo and the wire is mono
/// 2. Resample to the wire rate
/// 3. Apply the wire codec
pub fn encode_for_wire(
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
    target: &WireFormat,
) -> Result<Vec<u8>, FormatError> {
    target.validate()?;
    if channels == 0 || channels > 2 {
        return Err(FormatError::UnsupportedChannels(channels));
    }
    if samples.len() % channels as usize != 0 {
        return Err(FormatError::MisalignedBuffer {
            len: samples.len() * 2,
            stride: channels as usize * 2,
        });
    }

    let mono;
    let source: &[i16] = if channels == 2 && target.channels == 1 {
        mono = downmix_samples(samples);
        &mono
    } else {
        samples
    };
    let resampled = resample_samples(source, sample_rate, target.sample_rate)?;

    Ok(match target.codec {
        AudioCodec::Pcm16 => samples_to_bytes(&resampled),
        AudioCodec::Mulaw => resampled.iter().map(|&s| mulaw_encode_sample(s)).collect(),
        AudioCodec::Alaw => resampled.iter().map(|&s| alaw_encode_sample(s)).collect(),
    })
}

/// Decode wire bytes into interleaved PCM16 samples at the wire's own rate.
pub fn decode_from_wire(data: &[u8], format: &WireFormat) -> Result<Vec<i16>, FormatError> {
    format.validate()?;
    validate_stride(data, format.frame_stride())?;
    Ok(match format.codec {
        AudioCodec::Pcm16 => bytes_to_samples(data)?,
        AudioCodec::Mulaw => data.iter().map(|&b| mulaw_decode_sample(b)).collect(),
        AudioCodec::Alaw => data.iter().map(|&b| alaw_decode_sample(b)).collect(),
    })
}
