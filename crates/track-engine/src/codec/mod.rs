//! Decoder backends: native codec handles and the embedded software decoders.

pub mod native;
pub mod pcm;
pub mod software;

use std::fmt;

pub use native::{HandleState, NativeCodecLibrary, NativeConfig, NativeDecoderHandle};
pub use pcm::PcmCodecLibrary;
pub use software::SoftwareDecoder;

/// Which decoder a router settled on for its track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderBackend {
    Native,
    Software,
}

impl DecoderBackend {
    pub fn label(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Software => "software",
        }
    }
}

impl fmt::Display for DecoderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Interleaved PCM handed from a decoder to the filter pipeline.
#[derive(Clone, Copy, Debug)]
pub enum DecodedSamples<'a> {
    I16(&'a [i16]),
    F32(&'a [f32]),
}

impl DecodedSamples<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::I16(s) => s.len(),
            Self::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
