//! Channel up/down-mix stage.

/// Maps interleaved frames from one channel count to another.
///
/// Mapping rules:
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels, silence for missing ones
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelRemix {
    from: usize,
    to: usize,
}

impl ChannelRemix {
    /// `None` when the layouts already match.
    pub fn new(from: u16, to: u16) -> Option<Self> {
        (from != to && from > 0 && to > 0).then_some(Self {
            from: from as usize,
            to: to as usize,
        })
    }

    pub fn output_channels(&self) -> usize {
        self.to
    }

    pub fn apply(&self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        out.reserve(input.len() / self.from * self.to);
        for frame in input.chunks_exact(self.from) {
            for ch in 0..self.to {
                out.push(self.sample(frame, ch));
            }
        }
    }

    fn sample(&self, frame: &[f32], dst_ch: usize) -> f32 {
        match (self.from, self.to) {
            (2, 1) => 0.5 * (frame[0] + frame[1]),
            (1, _) => frame[0],
            _ => frame.get(dst_ch).copied().unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_layout_needs_no_stage() {
        assert!(ChannelRemix::new(2, 2).is_none());
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let remix = ChannelRemix::new(1, 2).unwrap();
        let mut out = Vec::new();
        remix.apply(&[0.25, -0.5], &mut out);
        assert_eq!(out, vec![0.25, 0.25, -0.5, -0.5]);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let remix = ChannelRemix::new(2, 1).unwrap();
        let mut out = Vec::new();
        remix.apply(&[1.0, 0.0, 0.5, 0.5], &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn surround_to_stereo_keeps_front_pair() {
        let remix = ChannelRemix::new(6, 2).unwrap();
        let mut out = Vec::new();
        remix.apply(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &mut out);
        assert_eq!(out, vec![0.1, 0.2]);

        let up = ChannelRemix::new(2, 4).unwrap();
        up.apply(&[0.1, 0.2], &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.0, 0.0]);
    }
}
