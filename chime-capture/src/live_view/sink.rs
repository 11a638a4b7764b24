use std::fs::File;
use std::io::BufWriter;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::nal::{Nal as _, RefNal};
use mp4::{AvcConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig, TrackType};
use webrtc::media::Sample;

/// Dimensions recorded in the track header when the SPS cannot be parsed.
const FALLBACK_DIMENSIONS: (u16, u16) = (1920, 1080);

/// 90 kHz video timescale; default per-sample duration of one 30 fps frame.
const VIDEO_TIMESCALE: u32 = 90_000;
const DEFAULT_SAMPLE_TICKS: u32 = 3_000;

const NAL_TYPE_NON_IDR: u8 = 1;
const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

#[derive(Debug, Clone)]
pub struct SinkReport {
    pub path: Utf8PathBuf,
    pub bytes_written: u64,
}

/// Consumer of the inbound media track.
///
/// `start` is idempotent and safe to call before any sample arrives.
/// `close` flushes, guarantees the output file is closed on disk, and hands
/// back the final path and byte size; a second `close` returns the same
/// report. Writer errors are logged by the caller and never fail the
/// recording, a partial file is still reported.
#[async_trait]
pub trait VideoSink: Send {
    async fn start(&mut self) -> anyhow::Result<()>;

    async fn write(&mut self, sample: &Sample) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<SinkReport>;
}

/// Splits an Annex-B elementary stream into NAL units, accepting both
/// 3-byte and 4-byte start codes.
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && (data[i + 2] == 1 || (i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1)) {
            let code_len = if data[i + 2] == 1 { 3 } else { 4 };
            if let Some(s) = start {
                units.push(&data[s..i]);
            }
            i += code_len;
            start = Some(i);
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s < data.len() {
            units.push(&data[s..]);
        }
    }

    units
}

fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// Length-prefixes the NAL units the way an `avcC`-configured track expects.
fn to_avcc(nals: &[&[u8]]) -> Vec<u8> {
    let total = nals.iter().map(|n| n.len() + 4).sum();
    let mut out = Vec::with_capacity(total);

    for nal in nals {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }

    out
}

fn sps_dimensions(sps: &[u8]) -> Option<(u16, u16)> {
    let nal = RefNal::new(sps, &[], true);
    let parsed = SeqParameterSet::from_bits(nal.rbsp_bits()).ok()?;
    let (width, height) = parsed.pixel_dimensions().ok()?;
    Some((u16::try_from(width).ok()?, u16::try_from(height).ok()?))
}

/// Records the received H.264 track to an MP4 file.
///
/// The muxer is initialised lazily: samples are inspected for SPS/PPS and
/// the first keyframe, and everything before that point is counted and
/// dropped.
pub struct Mp4Sink {
    path: Utf8PathBuf,
    writer: Option<Mp4Writer<BufWriter<File>>>,
    track_added: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    started: bool,
    elapsed_ticks: u64,
    samples_written: u64,
    samples_dropped: u64,
    report: Option<SinkReport>,
}

impl Mp4Sink {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            track_added: false,
            sps: None,
            pps: None,
            started: false,
            elapsed_ticks: 0,
            samples_written: 0,
            samples_dropped: 0,
            report: None,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn open_writer(&mut self) -> anyhow::Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = BufWriter::new(File::create(&self.path)?);

        let config = Mp4Config {
            major_brand: "isom".parse().expect("valid brand"),
            minor_version: 512,
            compatible_brands: vec![
                "isom".parse().expect("valid brand"),
                "iso2".parse().expect("valid brand"),
                "avc1".parse().expect("valid brand"),
                "mp41".parse().expect("valid brand"),
            ],
            timescale: 1000,
        };

        self.writer = Some(Mp4Writer::write_start(file, &config)?);

        Ok(())
    }

    fn try_add_track(&mut self) -> anyhow::Result<bool> {
        if self.track_added {
            return Ok(true);
        }

        let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone()) else {
            return Ok(false);
        };

        let (width, height) = sps_dimensions(&sps).unwrap_or_else(|| {
            warn!("Could not parse the SPS, falling back to default track dimensions");
            FALLBACK_DIMENSIONS
        });

        self.open_writer()?;

        let writer = self.writer.as_mut().expect("opened above");
        writer.add_track(&TrackConfig {
            track_type: TrackType::Video,
            timescale: VIDEO_TIMESCALE,
            language: "und".to_owned(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width,
                height,
                seq_param_set: sps,
                pic_param_set: pps,
            }),
        })?;

        self.track_added = true;
        debug!(width, height, path = %self.path, "Video track initialised");

        Ok(true)
    }

    fn sample_ticks(duration: std::time::Duration) -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ticks = (duration.as_secs_f64() * f64::from(VIDEO_TIMESCALE)).round() as u32;
        if ticks == 0 { DEFAULT_SAMPLE_TICKS } else { ticks }
    }
}

#[async_trait]
impl VideoSink for Mp4Sink {
    async fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }

        self.open_writer()?;
        self.started = true;
        info!(path = %self.path, "Video sink started");

        Ok(())
    }

    async fn write(&mut self, sample: &Sample) -> anyhow::Result<()> {
        let nals = split_annex_b(&sample.data);

        let mut is_sync = false;
        let mut has_vcl = false;

        for nal in &nals {
            match nal_type(nal) {
                NAL_TYPE_SPS => self.sps = Some(nal.to_vec()),
                NAL_TYPE_PPS => self.pps = Some(nal.to_vec()),
                NAL_TYPE_IDR => {
                    is_sync = true;
                    has_vcl = true;
                }
                NAL_TYPE_NON_IDR => has_vcl = true,
                _ => {}
            }
        }

        if !has_vcl {
            return Ok(());
        }

        // The track starts on the first keyframe once both parameter sets
        // are known; decoders cannot do anything with what came before.
        if !self.track_added && (!is_sync || !self.try_add_track()?) {
            self.samples_dropped += 1;
            return Ok(());
        }

        let ticks = Self::sample_ticks(sample.duration);
        let data = to_avcc(&nals);

        let writer = self.writer.as_mut().expect("track_added implies writer");
        writer.write_sample(
            1,
            &Mp4Sample {
                start_time: self.elapsed_ticks,
                duration: ticks,
                rendering_offset: 0,
                is_sync,
                bytes: bytes::Bytes::from(data),
            },
        )?;

        self.elapsed_ticks += u64::from(ticks);
        self.samples_written += 1;

        if self.samples_written == 1 || self.samples_written % 100 == 0 {
            debug!(samples = self.samples_written, "Receiving video");
        }

        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<SinkReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        if let Some(mut writer) = self.writer.take() {
            writer.write_end()?;

            let mut file = writer.into_writer();
            std::io::Write::flush(&mut file)?;
        }

        let bytes_written = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        let report = SinkReport {
            path: self.path.clone(),
            bytes_written,
        };

        info!(
            path = %report.path,
            size = report.bytes_written,
            samples = self.samples_written,
            dropped = self.samples_dropped,
            "Video sink closed",
        );

        self.report = Some(report.clone());

        Ok(report)
    }
}

/// Fans every sample out to several sinks, so a recording can feed a file
/// and other consumers at once.
pub struct FanoutSink {
    sinks: Vec<Box<dyn VideoSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn VideoSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl VideoSink for FanoutSink {
    async fn start(&mut self) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            sink.start().await?;
        }
        Ok(())
    }

    async fn write(&mut self, sample: &Sample) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            if let Err(error) = sink.write(sample).await {
                warn!(%error, "A fanout sink failed to consume a sample");
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<SinkReport> {
        let mut first_report = None;

        for sink in &mut self.sinks {
            match sink.close().await {
                Ok(report) => {
                    if first_report.is_none() {
                        first_report = Some(report);
                    }
                }
                Err(error) => warn!(%error, "A fanout sink failed to close"),
            }
        }

        first_report.ok_or_else(|| anyhow::anyhow!("fanout sink closed with no inner sink report"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    // Minimal parameter sets: enough structure for NAL-type routing; the
    // sink falls back to default dimensions when they don't parse.
    const SPS: &[u8] = &[
        0x67, 0x42, 0xc0, 0x1e, 0xd9, 0x01, 0xe0, 0x8f, 0xeb, 0x01, 0x10, 0x00, 0x00, 0x03, 0x00,
        0x10, 0x00, 0x00, 0x03, 0x03, 0xc0, 0xf1, 0x62, 0xe4, 0x80,
    ];
    const PPS: &[u8] = &[0x68, 0xcb, 0x83, 0xcb, 0x20];

    fn annex_b(units: &[&[u8]]) -> Bytes {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        Bytes::from(out)
    }

    fn sample(data: Bytes) -> Sample {
        Sample {
            data,
            duration: std::time::Duration::from_millis(33),
            ..Default::default()
        }
    }

    fn idr_unit(payload_len: usize) -> Vec<u8> {
        let mut unit = vec![0x65];
        unit.extend(std::iter::repeat_n(0xAB, payload_len));
        unit
    }

    #[test]
    fn splits_annex_b_with_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x11, 0x22];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0x33]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x44, 0x55]);

        let units = split_annex_b(&data);

        assert_eq!(units.len(), 3);
        assert_eq!(nal_type(units[0]), NAL_TYPE_SPS);
        assert_eq!(nal_type(units[1]), NAL_TYPE_PPS);
        assert_eq!(nal_type(units[2]), NAL_TYPE_IDR);
    }

    #[test]
    fn avcc_conversion_prefixes_lengths() {
        let nals: Vec<&[u8]> = vec![&[0x65, 0x01, 0x02]];
        let avcc = to_avcc(&nals);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x65, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn writes_a_playable_file_from_synthetic_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.mp4")).expect("utf8");

        let mut sink = Mp4Sink::new(path.clone());
        sink.start().await.expect("start");

        let keyframe = annex_b(&[SPS, PPS, &idr_unit(400)]);
        sink.write(&sample(keyframe)).await.expect("keyframe");

        for _ in 0..10 {
            let frame = annex_b(&[&[0x41, 0x9A, 0x00, 0x01, 0x02, 0x03]]);
            sink.write(&sample(frame)).await.expect("frame");
        }

        let report = sink.close().await.expect("close");

        assert_eq!(report.path, path);
        assert!(report.bytes_written > 0);

        let header = std::fs::read(path.as_std_path()).expect("read output");
        assert_eq!(&header[4..8], b"ftyp");
    }

    #[tokio::test]
    async fn samples_before_the_first_keyframe_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.mp4")).expect("utf8");

        let mut sink = Mp4Sink::new(path);
        sink.start().await.expect("start");

        let frame = annex_b(&[&[0x41, 0x9A, 0x00]]);
        sink.write(&sample(frame)).await.expect("write");

        assert_eq!(sink.samples_written, 0);
        assert_eq!(sink.samples_dropped, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_the_same_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.mp4")).expect("utf8");

        let mut sink = Mp4Sink::new(path);
        sink.start().await.expect("start");

        let first = sink.close().await.expect("first close");
        let second = sink.close().await.expect("second close");

        assert_eq!(first.bytes_written, second.bytes_written);
        assert_eq!(first.path, second.path);
    }

    #[tokio::test]
    async fn write_before_start_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.mp4")).expect("utf8");

        let mut sink = Mp4Sink::new(path);

        let keyframe = annex_b(&[SPS, PPS, &idr_unit(16)]);
        sink.write(&sample(keyframe)).await.expect("write");
        sink.start().await.expect("start");

        let report = sink.close().await.expect("close");
        assert!(report.bytes_written > 0);
    }
}
