use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use tracing::info;

use crate::detection::{Detect, filter_confident};
use crate::rendering::Annotator;
use crate::video::{
    ChannelOrder, Frame, Rational, VideoReader, VideoWriter, rational_to_f64, write_video,
};

/// Default minimum detection score.
pub const DEFAULT_CONFIDENCE: f32 = 0.45;
/// How often (in frames) stage timings are logged.
const TIMING_LOG_INTERVAL: u64 = 300;

/// How annotated frames reach the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncodeMode {
    /// Collect every annotated frame in memory, then encode in one go.
    #[default]
    Buffered,
    /// Open the encoder on the first frame and write each frame as it is
    /// annotated.  Memory use does not grow with video length.
    Streaming,
}

/// Reject thresholds outside `[0, 1]` (and NaN).
pub fn validate_threshold(threshold: f32) -> Result<f32> {
    ensure!(
        (0.0..=1.0).contains(&threshold),
        "confidence threshold must be within [0, 1], got {threshold}"
    );
    Ok(threshold)
}

// ── Accumulator ──────────────────────────────────────────────────────────────

/// Ordered in-memory sequence of annotated frames, stored in encoder (RGB)
/// order.  Unbounded.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    frames: Vec<Frame>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame.into_order(ChannelOrder::Rgb));
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

// ── Per-frame step ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct StageTimings {
    pub frames: u64,
    pub detections: u64,
    pub detect: Duration,
    pub annotate: Duration,
}

impl StageTimings {
    fn per_frame_ms(&self, total: Duration) -> String {
        if self.frames == 0 {
            return "0.00".to_string();
        }
        format!("{:.2}", total.as_secs_f64() * 1000.0 / self.frames as f64)
    }

    fn log(&self, message: &str) {
        info!(
            frames = self.frames,
            detections = self.detections,
            detect_ms_per_frame = self.per_frame_ms(self.detect),
            annotate_ms_per_frame = self.per_frame_ms(self.annotate),
            "{message}"
        );
    }
}

/// Detect → threshold filter → annotate, one frame at a time.
pub struct FrameProcessor<'a, D: Detect + ?Sized> {
    detector: &'a mut D,
    annotator: Annotator,
    threshold: f32,
    timings: StageTimings,
}

impl<'a, D: Detect + ?Sized> FrameProcessor<'a, D> {
    pub fn new(detector: &'a mut D, threshold: f32) -> Result<Self> {
        Ok(Self {
            detector,
            annotator: Annotator::default(),
            threshold: validate_threshold(threshold)?,
            timings: StageTimings::default(),
        })
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn timings(&self) -> StageTimings {
        self.timings
    }

    /// Annotate `frame` in place; returns the number of detections drawn.
    /// A detector failure is returned as-is and aborts the run.
    pub fn process(&mut self, frame: &mut Frame) -> Result<usize> {
        let detect_start = Instant::now();
        let mut detections = self
            .detector
            .detect(frame, self.threshold)
            .with_context(|| format!("detection failed on frame {}", self.timings.frames))?;
        filter_confident(&mut detections, self.threshold);
        self.timings.detect += detect_start.elapsed();

        let annotate_start = Instant::now();
        let drawn = self.annotator.annotate(frame, &detections);
        self.timings.annotate += annotate_start.elapsed();

        self.timings.frames += 1;
        self.timings.detections += drawn as u64;
        if self.timings.frames % TIMING_LOG_INTERVAL == 0 {
            self.timings.log("pipeline stage timings");
        }
        Ok(drawn)
    }
}

/// Run every frame through `processor` and collect the results in order.
/// `progress(done, total_hint)` is called after each frame.
pub fn annotate_frames<I, D>(
    frames: I,
    processor: &mut FrameProcessor<'_, D>,
    total_hint: u64,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<FrameAccumulator>
where
    I: IntoIterator<Item = Result<Frame>>,
    D: Detect + ?Sized,
{
    let mut accumulator = FrameAccumulator::new();
    for frame in frames {
        let mut frame = frame?;
        processor.process(&mut frame)?;
        accumulator.push(frame);
        progress(accumulator.len() as u64, total_hint);
    }
    Ok(accumulator)
}

// ── Whole-video run ──────────────────────────────────────────────────────────

/// What a successful run produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub detections: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

impl RunSummary {
    pub fn fps(&self) -> f64 {
        rational_to_f64(self.frame_rate)
    }
}

/// Where annotated frames are encoded to.
#[derive(Debug, Clone, Copy)]
pub struct EncodeTarget<'p> {
    pub path: &'p Path,
    pub frame_rate: Rational,
    pub mode: EncodeMode,
}

/// Annotate every frame of `frames` and encode the result to `target`.
///
/// `on_output(target.path)` fires once, right before the output file is
/// created.  Returns the number of frames written, or `Ok(None)` (with
/// `on_output` never called and nothing on disk) when `frames` is empty.
pub fn encode_annotated<I, D>(
    frames: I,
    processor: &mut FrameProcessor<'_, D>,
    target: EncodeTarget<'_>,
    total_hint: u64,
    on_output: &mut dyn FnMut(&Path),
    progress: &mut dyn FnMut(u64, u64),
) -> Result<Option<u64>>
where
    I: IntoIterator<Item = Result<Frame>>,
    D: Detect + ?Sized,
{
    match target.mode {
        EncodeMode::Buffered => {
            let accumulator = annotate_frames(frames, processor, total_hint, progress)?;
            if accumulator.is_empty() {
                return Ok(None);
            }
            on_output(target.path);
            write_video(target.path, accumulator.frames(), target.frame_rate)
        }
        EncodeMode::Streaming => {
            let mut writer: Option<VideoWriter> = None;
            for frame in frames {
                let mut frame = frame?;
                processor.process(&mut frame)?;
                let frame = frame.into_order(ChannelOrder::Rgb);
                if writer.is_none() {
                    on_output(target.path);
                    writer = Some(VideoWriter::create(
                        target.path,
                        frame.width,
                        frame.height,
                        target.frame_rate,
                    )?);
                }
                if let Some(w) = writer.as_mut() {
                    w.write_frame(&frame)?;
                    progress(w.frames_written(), total_hint);
                }
            }
            writer.map(VideoWriter::finish).transpose()
        }
    }
}

/// Decode `input`, annotate every frame and encode the result to `output`
/// at the input's frame rate.
///
/// `on_output(output)` fires once, right before the output file is created.
/// Returns `Ok(None)` (with `on_output` never called and nothing on disk)
/// when the input decodes to zero frames.
pub fn annotate_video<D, P>(
    input: P,
    output: &Path,
    detector: &mut D,
    threshold: f32,
    mode: EncodeMode,
    on_output: &mut dyn FnMut(&Path),
    progress: &mut dyn FnMut(u64, u64),
) -> Result<Option<RunSummary>>
where
    D: Detect + ?Sized,
    P: AsRef<Path>,
{
    let threshold = validate_threshold(threshold)?;
    let mut reader = VideoReader::open(input.as_ref())?;
    let info = reader.info();
    let mut processor = FrameProcessor::new(detector, threshold)?;

    info!(
        input = %input.as_ref().display(),
        threshold,
        ?mode,
        "starting annotation run"
    );

    let target = EncodeTarget {
        path: output,
        frame_rate: info.frame_rate,
        mode,
    };
    let written = encode_annotated(
        &mut reader,
        &mut processor,
        target,
        info.frame_count_hint,
        on_output,
        progress,
    );
    reader.close();
    let Some(frames) = written? else {
        info!("input produced no frames; no output written");
        return Ok(None);
    };

    let timings = processor.timings();
    timings.log("annotation run complete");
    Ok(Some(RunSummary {
        frames,
        detections: timings.detections,
        width: info.width,
        height: info.height,
        frame_rate: info.frame_rate,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, PERSON_CLASS};
    use anyhow::anyhow;

    fn numbered_frames(n: usize) -> Vec<Result<Frame>> {
        (0..n)
            .map(|i| {
                let mut f = Frame::filled(32, 24, ChannelOrder::Bgr, [i as u8, 0, 0]);
                f.pts = i as i64;
                Ok(f)
            })
            .collect()
    }

    fn no_detections(_: &Frame, _: f32) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }

    fn person(confidence: f32, x: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, 40.0, x + 60.0, 200.0),
            class_id: PERSON_CLASS,
            confidence,
        }
    }

    #[test]
    fn accumulator_keeps_every_frame_in_decode_order() {
        let mut detector = no_detections;
        let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
        let mut seen = Vec::new();
        let acc = annotate_frames(numbered_frames(7), &mut processor, 7, &mut |done, total| {
            seen.push((done, total))
        })
        .unwrap();

        assert_eq!(acc.len(), 7);
        let pts: Vec<i64> = acc.frames().iter().map(|f| f.pts).collect();
        assert_eq!(pts, (0..7).collect::<Vec<_>>());
        assert_eq!(seen.last(), Some(&(7, 7)));
        assert_eq!(processor.timings().frames, 7);
    }

    #[test]
    fn accumulator_converts_to_encoder_order() {
        let mut acc = FrameAccumulator::new();
        acc.push(Frame::filled(1, 1, ChannelOrder::Bgr, [1, 2, 3]));
        let frame = &acc.frames()[0];
        assert_eq!(frame.order, ChannelOrder::Rgb);
        assert_eq!(frame.data, vec![3, 2, 1]);
    }

    #[test]
    fn empty_input_yields_empty_accumulator() {
        let mut detector = no_detections;
        let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
        let acc = annotate_frames(Vec::new(), &mut processor, 0, &mut |_, _| {}).unwrap();
        assert!(acc.is_empty());
    }

    #[test]
    fn only_confident_detections_are_drawn() {
        let mut detector = |_: &Frame, _: f32| -> Result<Vec<Detection>> {
            Ok(vec![person(0.3, 10.0), person(0.5, 200.0), person(0.8, 400.0)])
        };
        let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
        let mut frame = Frame::filled(640, 480, ChannelOrder::Bgr, [0, 0, 0]);
        assert_eq!(processor.process(&mut frame).unwrap(), 2);

        let red = Some([0, 0, 255]);
        // left edge of each box
        assert_ne!(frame.pixel(10, 120), red);
        assert_eq!(frame.pixel(200, 120), red);
        assert_eq!(frame.pixel(400, 120), red);
    }

    #[test]
    fn detector_receives_the_threshold() {
        let mut seen = None;
        {
            let mut detector = |_: &Frame, t: f32| -> Result<Vec<Detection>> {
                seen = Some(t);
                Ok(Vec::new())
            };
            let mut processor = FrameProcessor::new(&mut detector, 0.65).unwrap();
            let mut frame = Frame::filled(8, 8, ChannelOrder::Bgr, [0, 0, 0]);
            processor.process(&mut frame).unwrap();
        }
        assert_eq!(seen, Some(0.65));
    }

    #[test]
    fn detector_failure_aborts_the_run() {
        let mut calls = 0;
        let mut detector = |_: &Frame, _: f32| -> Result<Vec<Detection>> {
            calls += 1;
            if calls == 2 {
                Err(anyhow!("inference exploded"))
            } else {
                Ok(Vec::new())
            }
        };
        let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
        let err = annotate_frames(numbered_frames(4), &mut processor, 4, &mut |_, _| {})
            .unwrap_err();
        assert!(format!("{err:#}").contains("inference exploded"));
    }

    #[test]
    fn decode_error_stops_accumulation() {
        let mut detector = no_detections;
        let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
        let mut frames = numbered_frames(2);
        frames.push(Err(anyhow!("corrupt packet")));
        assert!(annotate_frames(frames, &mut processor, 3, &mut |_, _| {}).is_err());
    }

    #[test]
    fn empty_source_writes_and_registers_nothing_in_either_mode() {
        let dir = tempfile::tempdir().unwrap();
        for mode in [EncodeMode::Buffered, EncodeMode::Streaming] {
            let output = dir.path().join(format!("{mode:?}.mp4"));
            let mut detector = no_detections;
            let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
            let mut announced = Vec::new();
            let mut ticks = 0;
            let target = EncodeTarget {
                path: &output,
                frame_rate: Rational::new(10, 1),
                mode,
            };
            let written = encode_annotated(
                Vec::new(),
                &mut processor,
                target,
                0,
                &mut |path: &Path| announced.push(path.to_path_buf()),
                &mut |_, _| ticks += 1,
            )
            .unwrap();

            assert_eq!(written, None, "{mode:?}");
            assert!(announced.is_empty(), "{mode:?} announced an output");
            assert_eq!(ticks, 0);
            assert!(!output.exists(), "{mode:?} created a file");
        }
    }

    #[test]
    fn streaming_stops_at_the_first_detector_error_before_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("never.mp4");
        let mut detector =
            |_: &Frame, _: f32| -> Result<Vec<Detection>> { Err(anyhow!("no model")) };
        let mut processor = FrameProcessor::new(&mut detector, 0.45).unwrap();
        let mut announced = false;
        let target = EncodeTarget {
            path: &output,
            frame_rate: Rational::new(10, 1),
            mode: EncodeMode::Streaming,
        };
        let result = encode_annotated(
            numbered_frames(3),
            &mut processor,
            target,
            3,
            &mut |_: &Path| announced = true,
            &mut |_, _| {},
        );

        assert!(result.is_err());
        assert!(!announced);
        assert!(!output.exists());
    }

    #[test]
    fn thresholds_outside_unit_interval_are_rejected() {
        assert!(validate_threshold(0.0).is_ok());
        assert!(validate_threshold(1.0).is_ok());
        assert!(validate_threshold(-0.05).is_err());
        assert!(validate_threshold(1.05).is_err());
        assert!(validate_threshold(f32::NAN).is_err());
        let mut detector = no_detections;
        assert!(FrameProcessor::new(&mut detector, 2.0).is_err());
    }
}
