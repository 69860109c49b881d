use std::path::PathBuf;

use image::GrayImage;
use kagami_config::ResolvedConfig;
use tracing::debug;
use v4l::buffer::Type;
use v4l::capability::{Capabilities, Flags as CapabilityFlags};
use v4l::format::{Format, FourCC};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;

use crate::engine::{Camera, Frame};
use crate::errors::{AuthError, AuthResult};

const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub device: PathBuf,
    pub pixel_format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub warmup_frames: u32,
}

impl CaptureSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            device: PathBuf::from(&config.video_device),
            pixel_format: config.pixel_format.clone(),
            width: config.capture_width,
            height: config.capture_height,
            warmup_frames: config.warmup_frames,
        }
    }
}

/// V4L2 camera with a negotiated grayscale-convertible format. The mmap
/// stream starts on the first capture and stays up until the camera drops.
pub struct V4lCamera {
    stream: Option<Stream<'static>>,
    device: v4l::Device,
    format: Format,
    card: String,
    warmup_frames: u32,
}

impl V4lCamera {
    pub fn open(settings: &CaptureSettings) -> AuthResult<Self> {
        let display = settings.device.display().to_string();
        let device =
            v4l::Device::with_path(&settings.device).map_err(|source| AuthError::DeviceOpen {
                device: display.clone(),
                source,
            })?;

        let caps = device.query_caps()?;
        ensure_capabilities(&caps)?;

        let requested = parse_fourcc(&settings.pixel_format)
            .ok_or_else(|| AuthError::UnsupportedFormat(settings.pixel_format.clone()))?;
        let formats = device.enum_formats()?;
        if !formats.iter().any(|format| format.fourcc == requested) {
            return Err(AuthError::UnsupportedFormat(fourcc_to_string(requested)));
        }

        let mut format = device.format()?;
        format.fourcc = requested;
        if let Some(width) = settings.width {
            format.width = width;
        }
        if let Some(height) = settings.height {
            format.height = height;
        }
        let format = device.set_format(&format)?;
        debug!(
            target: "kagami::face",
            device = %display,
            card = %caps.card,
            pixel_format = %fourcc_to_string(format.fourcc),
            width = format.width,
            height = format.height,
            "camera opened"
        );

        Ok(Self {
            stream: None,
            device,
            format,
            card: caps.card,
            warmup_frames: settings.warmup_frames,
        })
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn format(&self) -> (String, u32, u32) {
        (
            fourcc_to_string(self.format.fourcc),
            self.format.width,
            self.format.height,
        )
    }
}

impl Camera for V4lCamera {
    fn capture(&mut self) -> AuthResult<Frame> {
        if self.stream.is_none() {
            let mut stream =
                Stream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS)?;
            discard_warmup(self.warmup_frames, || stream.next().map(|_| ()))?;
            self.stream = Some(stream);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AuthError::FrameProcessing("capture stream not started".into()))?;
        match stream.next() {
            Ok((data, _)) => convert_frame_to_image(data, &self.format),
            Err(err) => {
                // A fresh stream, warm-up included, on the next capture.
                self.stream = None;
                Err(err.into())
            }
        }
    }
}

/// Throws away the first frames of a freshly started stream while exposure
/// settles.
fn discard_warmup<E, F>(frames: u32, mut next: F) -> AuthResult<()>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<(), E>,
{
    for idx in 0..frames {
        next().map_err(|err| {
            AuthError::FrameProcessing(format!(
                "failed to read warm-up frame {}: {}",
                idx + 1,
                err
            ))
        })?;
    }
    if frames > 0 {
        debug!(target: "kagami::face", frames, "discarded warm-up frames");
    }
    Ok(())
}

fn ensure_capabilities(caps: &Capabilities) -> AuthResult<()> {
    let flags = caps.capabilities;
    let mut reasons = Vec::new();
    if !flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
        reasons.push("missing VIDEO_CAPTURE");
    }
    if !flags.intersects(CapabilityFlags::READ_WRITE | CapabilityFlags::STREAMING) {
        reasons.push("missing READ_WRITE or STREAMING");
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(AuthError::Capability(reasons.join(", ")))
    }
}

pub fn convert_frame_to_image(data: &[u8], format: &Format) -> AuthResult<GrayImage> {
    let pixels = format.width as usize * format.height as usize;
    let pixel_format = fourcc_to_string(format.fourcc);

    let buffer = match pixel_format.as_str() {
        "Y16" => {
            require_len(data, pixels * 2, &pixel_format)?;
            // Keep the high byte of each little-endian sample.
            data[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect()
        }
        "GREY" | "Y08" => {
            require_len(data, pixels, &pixel_format)?;
            data[..pixels].to_vec()
        }
        "YUYV" => {
            require_len(data, pixels * 2, &pixel_format)?;
            if pixels % 2 != 0 {
                return Err(AuthError::FrameProcessing(
                    "incomplete YUYV macro-pixel encountered".into(),
                ));
            }
            data[..pixels * 2].iter().step_by(2).copied().collect()
        }
        other => {
            return Err(AuthError::FrameProcessing(format!(
                "unsupported conversion from pixel format {other}"
            )))
        }
    };

    GrayImage::from_vec(format.width, format.height, buffer)
        .ok_or_else(|| AuthError::FrameProcessing("failed to build image buffer".into()))
}

fn require_len(data: &[u8], expected: usize, pixel_format: &str) -> AuthResult<()> {
    if data.len() < expected {
        return Err(AuthError::FrameProcessing(format!(
            "expected {expected} bytes for {pixel_format} frame, got {}",
            data.len()
        )));
    }
    Ok(())
}

fn parse_fourcc(code: &str) -> Option<FourCC> {
    if code.is_empty() || code.len() > 4 {
        return None;
    }
    let mut repr = [b' '; 4];
    repr[..code.len()].copy_from_slice(code.as_bytes());
    Some(FourCC::new(&repr))
}

fn fourcc_to_string(fourcc: FourCC) -> String {
    String::from_utf8_lossy(&fourcc.repr)
        .trim_matches(|c| c == char::from(0) || c == ' ')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_format(fourcc: &str, width: u32, height: u32) -> Format {
        Format::new(width, height, parse_fourcc(fourcc).expect("fourcc"))
    }

    #[test]
    fn warmup_reads_the_configured_number_of_frames() {
        let mut reads = 0;
        discard_warmup(3, || {
            reads += 1;
            Ok::<(), std::io::Error>(())
        })
        .expect("warm-up");
        assert_eq!(reads, 3);
    }

    #[test]
    fn warmup_failure_names_the_frame() {
        let mut reads = 0;
        let err = discard_warmup(5, || {
            reads += 1;
            if reads == 2 {
                Err("device gone")
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(reads, 2);
        assert!(err.to_string().contains("warm-up frame 2: device gone"));
    }

    #[test]
    fn y16_keeps_high_byte() {
        let format = build_format("Y16", 2, 2);
        let data: Vec<u8> = vec![0, 0, 0x34, 0x12, 255, 255, 0, 0x80];
        let image = convert_frame_to_image(&data, &format).expect("convert y16");
        assert_eq!(image.as_raw(), &vec![0, 0x12, 255, 0x80]);
    }

    #[test]
    fn grey_passes_through() {
        let format = build_format("GREY", 2, 2);
        let data: Vec<u8> = vec![10, 20, 30, 40, 99];
        let image = convert_frame_to_image(&data, &format).expect("convert grey");
        assert_eq!(image.as_raw(), &vec![10, 20, 30, 40]);
    }

    #[test]
    fn yuyv_takes_luma_samples() {
        let format = build_format("YUYV", 2, 2);
        let data: Vec<u8> = vec![10, 128, 20, 128, 30, 64, 40, 64];
        let image = convert_frame_to_image(&data, &format).expect("convert yuyv");
        assert_eq!(image.as_raw(), &vec![10, 20, 30, 40]);
    }

    #[test]
    fn short_frames_are_rejected() {
        let format = build_format("GREY", 4, 4);
        let err = convert_frame_to_image(&[0; 3], &format).unwrap_err();
        assert!(matches!(err, AuthError::FrameProcessing(_)));
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let format = build_format("MJPG", 2, 2);
        assert!(convert_frame_to_image(&[0; 16], &format).is_err());
    }

    #[test]
    fn fourcc_round_trips_short_codes() {
        assert_eq!(fourcc_to_string(parse_fourcc("Y16").unwrap()), "Y16");
        assert!(parse_fourcc("TOOLONG").is_none());
    }

    #[test]
    fn settings_follow_config() {
        let config = kagami_config::ResolvedConfig::default();
        let settings = CaptureSettings::from_config(&config);
        assert_eq!(settings.device, PathBuf::from("/dev/video0"));
        assert_eq!(settings.pixel_format, "GREY");
    }
}
