//! Reader for the gadget's configfs function tree.
//!
//! The f_uvc function describes its capabilities (formats, frames, frame
//! intervals, endpoint parameters) as a directory tree of decimal text
//! files. The tree is read once at startup into an immutable
//! [`FunctionConfig`]; every failure here is fatal.

use crate::FourCc;
use anyhow::{bail, ensure, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIGFS_ROOT: &str = "/sys/kernel/config/usb_gadget";
pub const V4L_SYSFS_ROOT: &str = "/sys/class/video4linux";

/// One frame size and the intervals (100 ns units) it supports, in the
/// order the tree declares them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    pub intervals: Vec<u32>,
}

/// One pixel format and its frames, smallest area first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatConfig {
    pub fourcc: FourCc,
    pub frames: Vec<FrameConfig>,
}

/// Immutable description of a bound UVC function.
///
/// Format and frame indices are 1-based on the wire; `formats[0]` is
/// bFormatIndex 1.
#[derive(Clone, Debug)]
pub struct FunctionConfig {
    pub video_device: PathBuf,
    pub control_interface: u8,
    pub streaming_interface: u8,
    pub streaming_max_packet: u32,
    pub formats: Vec<FormatConfig>,
}

impl FunctionConfig {
    pub fn num_formats(&self) -> u32 {
        self.formats.len() as u32
    }
}

/// Locates and parses a UVC function in the configfs tree.
pub struct ConfigReader {
    configfs_root: PathBuf,
    v4l_root: PathBuf,
}

impl Default for ConfigReader {
    fn default() -> Self {
        Self::with_roots(CONFIGFS_ROOT, V4L_SYSFS_ROOT)
    }
}

impl ConfigReader {
    pub fn with_roots(configfs_root: impl Into<PathBuf>, v4l_root: impl Into<PathBuf>) -> Self {
        Self {
            configfs_root: configfs_root.into(),
            v4l_root: v4l_root.into(),
        }
    }

    /// Parse the function named by `function`: either a bare instance such
    /// as `uvc.0`, or a gadget-qualified path such as `g1/functions/uvc.0`.
    pub fn parse(&self, function: &str) -> Result<FunctionConfig> {
        let function_dir = self.resolve_function_dir(function)?;
        let instance = function_dir
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("invalid function directory {}", function_dir.display()))?
            .to_owned();
        debug!(function = %instance, dir = %function_dir.display(), "parsing UVC function");

        let control_interface = read_decimal(&function_dir.join("control/bInterfaceNumber"))? as u8;
        let streaming_interface =
            read_decimal(&function_dir.join("streaming/bInterfaceNumber"))? as u8;
        let streaming_max_packet = read_decimal(&function_dir.join("streaming_maxpacket"))?;

        let formats = parse_formats(&function_dir)
            .with_context(|| format!("enumerate formats of {instance}"))?;
        ensure!(!formats.is_empty(), "function {instance} declares no formats");

        let video_device = self.find_video_device(&instance)?;

        Ok(FunctionConfig {
            video_device,
            control_interface,
            streaming_interface,
            streaming_max_packet,
            formats,
        })
    }

    fn resolve_function_dir(&self, function: &str) -> Result<PathBuf> {
        if function.contains('/') {
            let dir = self.configfs_root.join(function);
            ensure!(dir.is_dir(), "no UVC function at {}", dir.display());
            return Ok(dir);
        }

        let mut matches = Vec::new();
        for gadget in list_dir(&self.configfs_root)? {
            let candidate = gadget.join("functions").join(function);
            if candidate.is_dir() {
                matches.push(candidate);
            }
        }
        match matches.len() {
            0 => bail!(
                "function {function} not found under {}",
                self.configfs_root.display()
            ),
            1 => Ok(matches.remove(0)),
            _ => bail!(
                "function {function} is ambiguous; qualify it as <gadget>/functions/{function}"
            ),
        }
    }

    /// Find the video node the function driver bound, through the
    /// `function_name` attribute the kernel exposes per video device.
    fn find_video_device(&self, instance: &str) -> Result<PathBuf> {
        for device in list_dir(&self.v4l_root)? {
            let Ok(bound) = fs::read_to_string(device.join("function_name")) else {
                continue;
            };
            if bound.trim() == instance {
                let node = device
                    .file_name()
                    .with_context(|| format!("invalid video device entry {}", device.display()))?
                    .to_owned();
                return Ok(Path::new("/dev").join(node));
            }
        }
        bail!("no video device bound to function {instance}")
    }
}

fn parse_formats(function_dir: &Path) -> Result<Vec<FormatConfig>> {
    let header_root = function_dir.join("streaming/header");
    let mut formats = Vec::new();
    for header in sorted_dir(&header_root)? {
        for link in sorted_dir(&header)? {
            let target = fs::canonicalize(&link)
                .with_context(|| format!("resolve format link {}", link.display()))?;
            let fourcc = format_fourcc(&target)?;
            let frames = parse_frames(&target)
                .with_context(|| format!("enumerate frames of {}", target.display()))?;
            ensure!(
                !frames.is_empty(),
                "format {} declares no frames",
                target.display()
            );
            formats.push(FormatConfig { fourcc, frames });
        }
    }
    Ok(formats)
}

fn format_fourcc(format_dir: &Path) -> Result<FourCc> {
    let kind = format_dir
        .parent()
        .and_then(|parent| parent.file_name())
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    match kind {
        "uncompressed" => Ok(FourCc::new(b"YUYV")),
        "mjpeg" => Ok(FourCc::new(b"MJPG")),
        other => bail!("unsupported format type {other:?}"),
    }
}

fn parse_frames(format_dir: &Path) -> Result<Vec<FrameConfig>> {
    let mut frames = Vec::new();
    for frame_dir in sorted_dir(format_dir)? {
        if !frame_dir.join("wWidth").is_file() {
            continue;
        }
        let width = read_decimal(&frame_dir.join("wWidth"))?;
        let height = read_decimal(&frame_dir.join("wHeight"))?;
        let intervals = read_decimal_list(&frame_dir.join("dwFrameInterval"))?;
        ensure!(
            !intervals.is_empty(),
            "frame {} declares no intervals",
            frame_dir.display()
        );
        frames.push(FrameConfig {
            width,
            height,
            intervals,
        });
    }
    // Keep wire indices meaningful: frame 1 is the smallest mode and the
    // last frame is the largest, which GET_MAX relies on.
    frames.sort_by_key(|frame| u64::from(frame.width) * u64::from(frame.height));
    Ok(frames)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        paths.push(entry.with_context(|| format!("read {}", dir.display()))?.path());
    }
    Ok(paths)
}

fn sorted_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = list_dir(dir)?;
    paths.sort();
    Ok(paths)
}

fn read_decimal(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    text.trim()
        .parse()
        .with_context(|| format!("parse {} as decimal", path.display()))
}

fn read_decimal_list(path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse()
                .with_context(|| format!("parse {line:?} in {}", path.display()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct FakeTree {
        root: TempDir,
    }

    impl FakeTree {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let tree = Self { root };
            tree.write("configfs/g1/functions/uvc.0/control/bInterfaceNumber", "0");
            tree.write("configfs/g1/functions/uvc.0/streaming/bInterfaceNumber", "1");
            tree.write("configfs/g1/functions/uvc.0/streaming_maxpacket", "3072");
            tree.frame("uncompressed/u", "360p", 640, 360, "166666\n200000\n333333\n500000");
            tree.frame("uncompressed/u", "720p", 1280, 720, "333333\n500000");
            tree.link("u", "../../uncompressed/u");
            tree.write("v4l/video4/function_name", "uvc.0\n");
            tree
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.root.path().join(rel)
        }

        fn write(&self, rel: &str, contents: &str) {
            let path = self.path(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        fn frame(&self, format: &str, name: &str, width: u32, height: u32, intervals: &str) {
            let base = format!("configfs/g1/functions/uvc.0/streaming/{format}/{name}");
            self.write(&format!("{base}/wWidth"), &width.to_string());
            self.write(&format!("{base}/wHeight"), &height.to_string());
            self.write(&format!("{base}/dwFrameInterval"), intervals);
        }

        fn link(&self, name: &str, target: &str) {
            let header = self.path("configfs/g1/functions/uvc.0/streaming/header/h");
            fs::create_dir_all(&header).unwrap();
            symlink(target, header.join(name)).unwrap();
        }

        fn reader(&self) -> ConfigReader {
            ConfigReader::with_roots(self.path("configfs"), self.path("v4l"))
        }
    }

    #[test]
    fn parses_bare_function_specifier() {
        let tree = FakeTree::new();
        let config = tree.reader().parse("uvc.0").unwrap();

        assert_eq!(config.video_device, Path::new("/dev/video4"));
        assert_eq!(config.control_interface, 0);
        assert_eq!(config.streaming_interface, 1);
        assert_eq!(config.streaming_max_packet, 3072);
        assert_eq!(config.formats.len(), 1);

        let format = &config.formats[0];
        assert_eq!(format.fourcc, FourCc::new(b"YUYV"));
        assert_eq!(format.frames.len(), 2);
        // Sorted by area: 640x360 first, 1280x720 last.
        assert_eq!(format.frames[0].width, 640);
        assert_eq!(
            format.frames[0].intervals,
            vec![166_666, 200_000, 333_333, 500_000]
        );
        assert_eq!(format.frames[1].width, 1280);
    }

    #[test]
    fn parses_gadget_qualified_specifier() {
        let tree = FakeTree::new();
        let config = tree.reader().parse("g1/functions/uvc.0").unwrap();
        assert_eq!(config.formats.len(), 1);
    }

    #[test]
    fn mjpeg_formats_are_recognized() {
        let tree = FakeTree::new();
        tree.frame("mjpeg/m", "720p", 1280, 720, "333333");
        tree.link("m", "../../mjpeg/m");
        let config = tree.reader().parse("uvc.0").unwrap();
        assert_eq!(config.formats.len(), 2);
        // Header links enumerate in sorted order: "m" before "u".
        assert_eq!(config.formats[0].fourcc, FourCc::new(b"MJPG"));
        assert_eq!(config.formats[1].fourcc, FourCc::new(b"YUYV"));
    }

    #[test]
    fn ambiguous_bare_specifier_is_rejected() {
        let tree = FakeTree::new();
        tree.write("configfs/g2/functions/uvc.0/streaming_maxpacket", "1024");
        let err = tree.reader().parse("uvc.0").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn missing_function_is_fatal() {
        let tree = FakeTree::new();
        assert!(tree.reader().parse("uvc.9").is_err());
    }

    #[test]
    fn unbound_function_has_no_video_device() {
        let tree = FakeTree::new();
        tree.write("v4l/video4/function_name", "uvc.7\n");
        let err = tree.reader().parse("uvc.0").unwrap_err();
        assert!(err.to_string().contains("no video device"));
    }
}
