//! Sample-encoding stage: interleaved samples to output bytes.

use crate::format::SampleEncoding;

/// Float sample to signed 16-bit with rounding and clipping.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Append 16-bit samples to `out` in `encoding`.
pub fn encode_i16(samples: &[i16], encoding: SampleEncoding, out: &mut Vec<u8>) {
    out.reserve(samples.len() * encoding.bytes_per_sample());
    match encoding {
        SampleEncoding::S16Le => samples
            .iter()
            .for_each(|s| out.extend_from_slice(&s.to_le_bytes())),
        SampleEncoding::S16Be => samples
            .iter()
            .for_each(|s| out.extend_from_slice(&s.to_be_bytes())),
        SampleEncoding::F32Le => samples
            .iter()
            .for_each(|s| out.extend_from_slice(&(*s as f32 / 32768.0).to_le_bytes())),
    }
}

/// Append float samples to `out` in `encoding`.
pub fn encode_f32(samples: &[f32], encoding: SampleEncoding, out: &mut Vec<u8>) {
    out.reserve(samples.len() * encoding.bytes_per_sample());
    match encoding {
        SampleEncoding::S16Le => samples
            .iter()
            .for_each(|s| out.extend_from_slice(&f32_to_i16(*s).to_le_bytes())),
        SampleEncoding::S16Be => samples
            .iter()
            .for_each(|s| out.extend_from_slice(&f32_to_i16(*s).to_be_bytes())),
        SampleEncoding::F32Le => samples
            .iter()
            .for_each(|s| out.extend_from_slice(&s.to_le_bytes())),
    }
}
