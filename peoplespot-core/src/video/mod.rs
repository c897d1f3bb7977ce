//! video — FFmpeg bridge
//!
//! Decoding side: `VideoReader` opens a container, reports its geometry and
//! frame rate, and yields packed 24-bit frames lazily in decode order.
//!
//! Encoding side: `VideoWriter` takes packed RGB frames one at a time and muxes
//! them as H.264 (no audio) at a fixed frame rate: yuv420p when both
//! dimensions are even, yuv444p otherwise (4:2:0 chroma needs even sizes).  `write_video` is
//! the whole-sequence convenience used by the buffered pipeline.

use anyhow::{Context, Result, bail, ensure};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, decoder, encoder, format, frame, media, software::scaling};
pub use ffmpeg_next::util::rational::Rational;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Scaling flags — bilinear is fast and good enough for the decode→encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Encoder pixel format for a `width × height` output.  yuv420p plays
/// everywhere but libx264 rejects it for odd dimensions.
pub fn encode_format(width: u32, height: u32) -> format::Pixel {
    if width % 2 == 0 && height % 2 == 0 {
        format::Pixel::YUV420P
    } else {
        format::Pixel::YUV444P
    }
}

/// libx264 rate control for the annotated output.
const ENCODE_OPTIONS: [(&str, &str); 2] = [("crf", "23"), ("preset", "medium")];

/// Byte order of the three channels in a packed `Frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    /// Order frames are decoded in.
    Bgr,
    /// Order the encoder consumes.
    Rgb,
}

/// A single video frame: packed 24-bit pixels, row-major, no stride padding,
/// along with its presentation timestamp (in the source stream's time base).
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    pub order: ChannelOrder,
}

impl Frame {
    /// A frame where every pixel is `[c0, c1, c2]` in `order`.
    pub fn filled(width: u32, height: u32, order: ChannelOrder, pixel: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&pixel);
        }
        Self {
            data,
            width,
            height,
            pts: 0,
            order,
        }
    }

    /// Raw channel triple at `(x, y)`, in the frame's own order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 3) as usize;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Reorder channels in-place if `order` differs from the current one.
    pub fn into_order(mut self, order: ChannelOrder) -> Self {
        if self.order != order {
            // BGR <-> RGB is the same swap in both directions.
            for px in self.data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            self.order = order;
        }
        self
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .field("order", &self.order)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Stream properties reported by [`probe`] and [`VideoReader::info`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    /// Container-reported frame count (or a duration × fps estimate); 0 if unknown.
    pub frame_count_hint: u64,
    pub has_audio: bool,
    pub codec: codec::Id,
}

impl VideoInfo {
    pub fn fps(&self) -> f64 {
        rational_to_f64(self.frame_rate)
    }
}

pub(crate) fn rational_to_f64(r: Rational) -> f64 {
    if r.denominator() == 0 {
        return 0.0;
    }
    r.numerator() as f64 / r.denominator() as f64
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Lazy, finite, non-restartable frame source over a video file.
///
/// Frames come out in BGR order.  The iterator fuses after end-of-stream or
/// after the first decode error.  The decode handle is held until [`close`]
/// is called or the reader is dropped.
///
/// [`close`]: VideoReader::close
pub struct VideoReader {
    input: format::context::Input,
    decoder: decoder::Video,
    to_bgr: scaling::Context,
    stream_index: usize,
    info: VideoInfo,
    decoded: frame::Video,
    converted: frame::Video,
    draining: bool,
    finished: bool,
    frames_read: u64,
}

impl VideoReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let path = path.as_ref();

        let input = format::input(&path)
            .with_context(|| format!("could not open input video {}", path.display()))?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();
        let frame_rate = stream_frame_rate(&stream);
        let frame_count_hint = estimate_frames(&stream);

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;
        let has_audio = input.streams().best(media::Type::Audio).is_some();

        let width = decoder.width();
        let height = decoder.height();
        ensure!(width > 0 && height > 0, "video stream reports empty dimensions");

        let to_bgr = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::BGR24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-BGR scaler")?;

        let info = VideoInfo {
            width,
            height,
            frame_rate,
            frame_count_hint,
            has_audio,
            codec: decoder.id(),
        };
        info!(
            width,
            height,
            fps = info.fps(),
            codec = ?info.codec,
            "opened input video stream"
        );

        Ok(Self {
            input,
            decoder,
            to_bgr,
            stream_index,
            info,
            decoded: frame::Video::empty(),
            converted: frame::Video::empty(),
            draining: false,
            finished: false,
            frames_read: 0,
        })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Release the decode handle.
    pub fn close(self) {
        debug!(frames = self.frames_read, "closing video reader");
    }

    fn convert_decoded(&mut self) -> Result<Frame> {
        self.to_bgr
            .run(&self.decoded, &mut self.converted)
            .context("to-BGR scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let stride = self.converted.stride(0);
        let raw = self.converted.data(0);
        let mut data = Vec::with_capacity(width * height * 3);
        for row in 0..height {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width * 3]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frames_read as i64);
        self.frames_read += 1;
        Ok(Frame {
            data,
            width: self.info.width,
            height: self.info.height,
            pts,
            order: ChannelOrder::Bgr,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => return self.convert_decoded().map(Some),
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {}
                Err(e) => return Err(e).context("decoder receive_frame"),
            }

            if self.draining {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("decoder send_eof")?;
                    self.draining = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }
}

impl Iterator for VideoReader {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                debug!(frames = self.frames_read, "end of video stream");
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Probe a video file without decoding any frames.
pub fn probe<P: AsRef<Path>>(path: P) -> Result<VideoInfo> {
    VideoReader::open(path).map(|r| r.info())
}

/// Return the approximate total frame count for a video file (used for
/// progress reporting).  Falls back to 0 if the count cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    estimate_frames(&stream)
}

fn estimate_frames(stream: &format::stream::Stream<'_>) -> u64 {
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream_frame_rate(stream);
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        return (seconds * rational_to_f64(fps)).round() as u64;
    }
    0
}

fn stream_frame_rate(stream: &format::stream::Stream<'_>) -> Rational {
    let avg = stream.avg_frame_rate();
    if avg.numerator() > 0 && avg.denominator() > 0 {
        return avg;
    }
    stream.rate()
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Incremental H.264 encoder + MP4 muxer.  No audio stream is ever created.
pub struct VideoWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
    frames_written: u64,
    path: PathBuf,
}

impl VideoWriter {
    /// Create `path` and write the container header.  The encoder time base
    /// is `1 / frame_rate`, so frame `n` gets pts `n`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        frame_rate: Rational,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        ensure!(width > 0 && height > 0, "cannot encode empty frames");
        ensure!(
            frame_rate.numerator() > 0 && frame_rate.denominator() > 0,
            "invalid output frame rate {frame_rate}"
        );
        let path = path.as_ref().to_path_buf();

        let mut octx = format::output(&path)
            .with_context(|| format!("could not create output {}", path.display()))?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

        let pixel_format = encode_format(width, height);
        let time_base = frame_rate.invert();
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(pixel_format);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let encoder = builder
            .open_as_with(encoder_codec, ffmpeg::Dictionary::from_iter(ENCODE_OPTIONS))
            .context("failed to open H.264 encoder")?;

        let stream_index = {
            let mut stream = octx.add_stream(encoder_codec)?;
            stream.set_parameters(&encoder);
            stream.set_time_base(time_base);
            stream.set_avg_frame_rate(frame_rate);
            stream.set_rate(frame_rate);
            stream.index()
        };

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            pixel_format,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header()
            .context("failed to write output header")?;
        info!(
            width,
            height,
            %frame_rate,
            pixel_format = ?pixel_format,
            path = %path.display(),
            "opened H.264 output"
        );

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            width,
            height,
            frames_written: 0,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Encode one RGB frame.  Frames must match the writer's dimensions.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        ensure!(
            frame.order == ChannelOrder::Rgb,
            "encoder expects RGB frames, got {:?}",
            frame.order
        );
        ensure!(
            frame.width == self.width && frame.height == self.height,
            "frame is {}x{}, encoder was opened for {}x{}",
            frame.width,
            frame.height,
            self.width,
            self.height
        );

        let row_bytes = self.width as usize * 3;
        let stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.height as usize {
            let dst = row * stride;
            let src = row * row_bytes;
            plane[dst..dst + row_bytes].copy_from_slice(&frame.data[src..src + row_bytes]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.frames_written as i64));

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        drain_encoder(
            &mut self.encoder,
            &mut self.octx,
            self.stream_index,
            self.time_base,
        )?;

        self.frames_written += 1;
        if self.frames_written % 100 == 0 {
            debug!(frames = self.frames_written, "encoded frames");
        }
        Ok(())
    }

    /// Flush the encoder and write the trailer.  Returns the frame count.
    pub fn finish(mut self) -> Result<u64> {
        self.encoder.send_eof().context("encoder send_eof")?;
        drain_encoder(
            &mut self.encoder,
            &mut self.octx,
            self.stream_index,
            self.time_base,
        )?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(
            frames = self.frames_written,
            path = %self.path.display(),
            "encode complete"
        );
        Ok(self.frames_written)
    }
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn drain_encoder(
    encoder: &mut encoder::Video,
    octx: &mut format::context::Output,
    stream_index: usize,
    time_base: Rational,
) -> Result<()> {
    let stream_tb = octx
        .stream(stream_index)
        .context("output stream disappeared")?
        .time_base();
    let mut encoded = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        // one packet per frame, one time-base tick per frame
        encoded.set_duration(1);
        encoded.rescale_ts(time_base, stream_tb);
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}

/// Encode an ordered frame sequence into `path` at `frame_rate`.
///
/// Returns `Ok(None)` without creating anything when `frames` is empty.
pub fn write_video<P: AsRef<Path>>(
    path: P,
    frames: &[Frame],
    frame_rate: Rational,
) -> Result<Option<u64>> {
    let Some(first) = frames.first() else {
        return Ok(None);
    };
    let mut writer = VideoWriter::create(path, first.width, first.height, frame_rate)?;
    for frame in frames {
        writer.write_frame(frame)?;
    }
    writer.finish().map(Some)
}

/// Whether the linked FFmpeg has any H.264 encoder.
pub fn h264_available() -> bool {
    if ffmpeg::init().is_err() {
        return false;
    }
    encoder::find(codec::Id::H264).is_some()
}

/// Parse `"30"`, `"29.97"` or `"30000/1001"` into a frame rate.
pub fn parse_frame_rate(s: &str) -> Result<Rational> {
    let s = s.trim();
    if let Some((num, den)) = s.split_once('/') {
        let num: i32 = num.trim().parse().context("bad frame rate numerator")?;
        let den: i32 = den.trim().parse().context("bad frame rate denominator")?;
        if num <= 0 || den <= 0 {
            bail!("frame rate must be positive: {s}");
        }
        return Ok(Rational::new(num, den));
    }
    let fps: f64 = s.parse().context("bad frame rate")?;
    if !(fps.is_finite() && fps > 0.0) {
        bail!("frame rate must be positive: {s}");
    }
    if fps.fract() == 0.0 {
        return Ok(Rational::new(fps as i32, 1));
    }
    Ok(Rational::new((fps * 1000.0).round() as i32, 1000).reduce())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_order_swaps_outer_channels() {
        let frame = Frame::filled(2, 1, ChannelOrder::Bgr, [10, 20, 30]);
        let rgb = frame.into_order(ChannelOrder::Rgb);
        assert_eq!(rgb.order, ChannelOrder::Rgb);
        assert_eq!(rgb.pixel(0, 0), Some([30, 20, 10]));
        assert_eq!(rgb.pixel(1, 0), Some([30, 20, 10]));
    }

    #[test]
    fn into_order_same_order_is_untouched() {
        let frame = Frame::filled(1, 1, ChannelOrder::Rgb, [1, 2, 3]);
        assert_eq!(frame.into_order(ChannelOrder::Rgb).data, vec![1, 2, 3]);
    }

    #[test]
    fn pixel_out_of_bounds_is_none() {
        let frame = Frame::filled(4, 3, ChannelOrder::Rgb, [0, 0, 0]);
        assert!(frame.pixel(4, 0).is_none());
        assert!(frame.pixel(0, 3).is_none());
        assert!(frame.pixel(3, 2).is_some());
    }

    #[test]
    fn parse_frame_rate_forms() {
        assert_eq!(parse_frame_rate("10").unwrap(), Rational::new(10, 1));
        assert_eq!(parse_frame_rate("30000/1001").unwrap(), Rational::new(30000, 1001));
        let r = parse_frame_rate("12.5").unwrap();
        assert!((rational_to_f64(r) - 12.5).abs() < 1e-9);
        assert!(parse_frame_rate("0").is_err());
        assert!(parse_frame_rate("-3/1").is_err());
        assert!(parse_frame_rate("fast").is_err());
    }

    #[test]
    fn odd_dimensions_fall_back_to_full_chroma() {
        assert_eq!(encode_format(640, 480), format::Pixel::YUV420P);
        assert_eq!(encode_format(641, 480), format::Pixel::YUV444P);
        assert_eq!(encode_format(640, 481), format::Pixel::YUV444P);
        assert_eq!(encode_format(1, 1), format::Pixel::YUV444P);
    }

    #[test]
    fn write_video_with_no_frames_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mp4");
        let written = write_video(&path, &[], Rational::new(10, 1)).unwrap();
        assert!(written.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn writer_rejects_bgr_frames() {
        if !h264_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bgr.mp4");
        let mut writer = VideoWriter::create(&path, 64, 48, Rational::new(10, 1)).unwrap();
        let frame = Frame::filled(64, 48, ChannelOrder::Bgr, [0, 0, 0]);
        assert!(writer.write_frame(&frame).is_err());
    }
}
