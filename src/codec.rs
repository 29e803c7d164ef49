//! Thumbnail rendering.
//!
//! The worker pool only talks to [`ThumbnailCodec`]. [`StandardCodec`] is the
//! default implementation: the `image` crate for stills and FFmpeg for video.

use crate::formats::MediaKind;
use exif::{In, Tag};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Letterbox color behind thumbnails that are not square.
const BACKGROUND: Rgb<u8> = Rgb([16, 16, 16]);
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported media: {0}")]
    Unsupported(String),
}

/// Extra facts the codec learned while rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rendered {
    /// Container-declared rotation in degrees (video only).
    pub rotation: Option<i32>,
}

pub trait ThumbnailCodec: Send + Sync {
    /// Render a `size` x `size` JPEG thumbnail of `source` into `target`.
    fn render(
        &self,
        source: &Path,
        kind: MediaKind,
        target: &Path,
        size: u32,
    ) -> Result<Rendered, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl ThumbnailCodec for StandardCodec {
    fn render(
        &self,
        source: &Path,
        kind: MediaKind,
        target: &Path,
        size: u32,
    ) -> Result<Rendered, CodecError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Render next to the target and rename, so a crash never leaves a half-written artifact.
        let partial = partial_path(target);
        let result = match kind {
            MediaKind::Image => render_image(source, &partial, size).map(|_| Rendered::default()),
            MediaKind::Video => render_video(source, &partial, size),
        };
        match result {
            Ok(rendered) => {
                fs::rename(&partial, target)?;
                Ok(rendered)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.partial.jpg", stem))
}

/// EXIF orientation tag (1-8), if the container carries one.
fn exif_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(Tag::Orientation, In::PRIMARY)?;
    field.value.get_uint(0)
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Fit `img` inside a `size` square, centered on the background color.
fn letterbox(img: &DynamicImage, size: u32) -> RgbImage {
    let fitted = img.resize(size, size, FilterType::Lanczos3).to_rgb8();
    let mut canvas = RgbImage::from_pixel(size, size, BACKGROUND);
    let x = (size - fitted.width()) / 2;
    let y = (size - fitted.height()) / 2;
    imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
    canvas
}

fn render_image(source: &Path, target: &Path, size: u32) -> Result<(), CodecError> {
    let img = image::open(source).map_err(|e| match e {
        image::ImageError::Unsupported(u) => CodecError::Unsupported(u.to_string()),
        image::ImageError::IoError(io) => CodecError::Io(io),
        other => CodecError::Decode(other.to_string()),
    })?;
    let img = match exif_orientation(source) {
        Some(orientation) => apply_orientation(img, orientation),
        None => img,
    };

    let canvas = letterbox(&img, size);
    let mut writer = BufWriter::new(File::create(target)?);
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
    encoder
        .encode(
            canvas.as_raw(),
            canvas.width(),
            canvas.height(),
            image::ColorType::Rgb8,
        )
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    debug!("Rendered image thumbnail {:?} -> {:?}", source, target);
    Ok(())
}

/// Extract one representative frame with FFmpeg, scaled and padded to a square.
fn render_video(source: &Path, target: &Path, size: u32) -> Result<Rendered, CodecError> {
    let filter = format!(
        "thumbnail,scale={s}:{s}:force_original_aspect_ratio=decrease:flags=lanczos,pad={s}:{s}:(ow-iw)/2:(oh-ih)/2:color=0x101010",
        s = size
    );
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(source)
        .args(["-frames:v", "1", "-vf", &filter])
        .arg(target)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CodecError::Unsupported("FFmpeg not found in PATH".to_string())
            }
            _ => CodecError::Io(e),
        })?;

    if !output.status.success() || !target.exists() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CodecError::Decode(format!("FFmpeg failed: {}", stderr.trim())));
    }

    let rotation = probe_rotation(source);
    info!("Video thumbnail generated: {:?}", target);
    Ok(Rendered { rotation })
}

/// Rotation declared by the container, via ffprobe. Absent tools or tags yield `None`.
fn probe_rotation(source: &Path) -> Option<i32> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream_tags=rotate:stream_side_data=rotation",
            "-of",
            "default=nw=1:nk=1",
        ])
        .arg(source)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_rotation(&String::from_utf8_lossy(&output.stdout))
}

fn parse_rotation(probe_output: &str) -> Option<i32> {
    probe_output
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .map(|deg| (deg.round() as i32).rem_euclid(360))
        .next()
}
