//! Per-buffer audio data handed to the sound hook
//!
//! Buffers are allocated once when the stream opens and reused for every
//! callback. Channels are stored non-interleaved (one contiguous run of
//! `frames_per_buffer` samples per channel); backends interleave on the way
//! out.

/// Audio buffers and frame cursor for one callback.
///
/// The hook iterates frames with [`next_frame`](Self::next_frame):
///
/// ```
/// # use weave::audio::AudioIOData;
/// # let mut io = AudioIOData::new(64, 2, 0, 44100.0);
/// while io.next_frame() {
///     io.set_out(0, 0.25);
///     io.set_out(1, -0.25);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AudioIOData {
    frames_per_buffer: usize,
    channels_out: usize,
    channels_in: usize,
    sample_rate: f64,
    /// Index of the frame the accessors address
    frame: usize,
    /// Next frame `next_frame` will move to
    cursor: usize,
    out: Vec<f32>,
    input: Vec<f32>,
}

impl AudioIOData {
    pub fn new(
        frames_per_buffer: usize,
        channels_out: usize,
        channels_in: usize,
        sample_rate: f64,
    ) -> Self {
        Self {
            frames_per_buffer,
            channels_out,
            channels_in,
            sample_rate,
            frame: 0,
            cursor: 0,
            out: vec![0.0; frames_per_buffer * channels_out],
            input: vec![0.0; frames_per_buffer * channels_in],
        }
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }

    pub fn channels_out(&self) -> usize {
        self.channels_out
    }

    pub fn channels_in(&self) -> usize {
        self.channels_in
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Rewind the frame cursor to the start of the buffer.
    pub fn reset_frame(&mut self) {
        self.frame = 0;
        self.cursor = 0;
    }

    /// Advance to the next frame. Returns `false` once the buffer is done.
    pub fn next_frame(&mut self) -> bool {
        if self.cursor < self.frames_per_buffer {
            self.frame = self.cursor;
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// Current frame index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Silence every output channel.
    pub fn zero_outputs(&mut self) {
        self.out.fill(0.0);
    }

    /// Output sample at the current frame.
    pub fn out(&self, channel: usize) -> f32 {
        self.out_index(channel).map_or(0.0, |i| self.out[i])
    }

    /// Overwrite the output sample at the current frame. Out-of-range
    /// channels are ignored.
    pub fn set_out(&mut self, channel: usize, value: f32) {
        if let Some(i) = self.out_index(channel) {
            self.out[i] = value;
        }
    }

    /// Add to the output sample at the current frame.
    pub fn sum(&mut self, channel: usize, value: f32) {
        if let Some(i) = self.out_index(channel) {
            self.out[i] += value;
        }
    }

    /// Input sample at the current frame.
    pub fn input(&self, channel: usize) -> f32 {
        if channel >= self.channels_in || self.frame >= self.frames_per_buffer {
            return 0.0;
        }
        self.input[channel * self.frames_per_buffer + self.frame]
    }

    /// Whole output channel.
    pub fn out_buffer(&self, channel: usize) -> &[f32] {
        self.channel_slice(channel, self.channels_out)
            .map_or(&[], |range| &self.out[range])
    }

    pub fn out_buffer_mut(&mut self, channel: usize) -> &mut [f32] {
        match self.channel_slice(channel, self.channels_out) {
            Some(range) => &mut self.out[range],
            None => &mut [],
        }
    }

    /// Whole input channel, for backends filling captured audio.
    pub fn input_buffer_mut(&mut self, channel: usize) -> &mut [f32] {
        match self.channel_slice(channel, self.channels_in) {
            Some(range) => &mut self.input[range],
            None => &mut [],
        }
    }

    /// Copy interleaved captured samples into the input channels.
    pub fn deinterleave_input(&mut self, interleaved: &[f32]) {
        let channels = self.channels_in;
        if channels == 0 {
            return;
        }
        for (frame, chunk) in interleaved
            .chunks_exact(channels)
            .take(self.frames_per_buffer)
            .enumerate()
        {
            for (channel, &sample) in chunk.iter().enumerate() {
                self.input[channel * self.frames_per_buffer + frame] = sample;
            }
        }
    }

    /// Write the output channels interleaved into `dest`. Returns the number
    /// of frames written, which is `frames_per_buffer` whenever `dest` can
    /// hold a whole buffer.
    pub fn interleave_into(&self, dest: &mut [f32]) -> usize {
        let channels = self.channels_out;
        if channels == 0 {
            return 0;
        }
        let frames = (dest.len() / channels).min(self.frames_per_buffer);
        for frame in 0..frames {
            for channel in 0..channels {
                dest[frame * channels + channel] = self.out[channel * self.frames_per_buffer + frame];
            }
        }
        frames
    }

    fn out_index(&self, channel: usize) -> Option<usize> {
        (channel < self.channels_out && self.frame < self.frames_per_buffer)
            .then(|| channel * self.frames_per_buffer + self.frame)
    }

    fn channel_slice(&self, channel: usize, channels: usize) -> Option<std::ops::Range<usize>> {
        (channel < channels).then(|| {
            let start = channel * self.frames_per_buffer;
            start..start + self.frames_per_buffer
        })
    }
}
