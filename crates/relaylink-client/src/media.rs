//! Local video source selection and the sink that owns remote-media readers.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const IVF_SIGNATURE: &[u8; 4] = b"DKIF";
const IVF_HEADER_LEN: usize = 32;

/// Parsed IVF container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_denominator: u32,
    pub timebase_numerator: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IVF_HEADER_LEN || &bytes[0..4] != IVF_SIGNATURE {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            fourcc: [bytes[8], bytes[9], bytes[10], bytes[11]],
            width: u16_at(12),
            height: u16_at(14),
            timebase_denominator: u32_at(16),
            timebase_numerator: u32_at(20),
            frame_count: u32_at(24),
        })
    }

    pub fn is_vp8(&self) -> bool {
        &self.fourcc == b"VP80"
    }
}

/// Which video the session sends to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// A VP8 IVF file played once at its own frame rate.
    File { path: PathBuf, header: IvfHeader },
    /// Fallback VP8 track. It is negotiated so the peer sees a video stream, but no
    /// frames are written to it since no raw-frame encoder is linked in.
    Pattern,
}

impl VideoSource {
    /// Uses `path` when it names a readable VP8 IVF file, otherwise falls back to the
    /// synthesized pattern.
    pub fn select(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::Pattern;
        };
        match read_ivf_header(path) {
            Ok(header) if header.is_vp8() => {
                info!(path = %path.display(), width = header.width, height = header.height, "streaming video file");
                Self::File {
                    path: path.to_path_buf(),
                    header,
                }
            }
            Ok(header) => {
                warn!(
                    path = %path.display(),
                    fourcc = %String::from_utf8_lossy(&header.fourcc),
                    "unsupported codec in video file, using pattern"
                );
                Self::Pattern
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "cannot open video file, using pattern");
                Self::Pattern
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Pattern => "pattern",
        }
    }
}

fn read_ivf_header(path: &Path) -> Result<IvfHeader, String> {
    let mut buf = [0u8; IVF_HEADER_LEN];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut buf))
        .map_err(|e| e.to_string())?;
    IvfHeader::parse(&buf).ok_or_else(|| "not an IVF file".to_string())
}

#[derive(Debug, Default)]
struct SinkInner {
    running: bool,
    readers: Vec<JoinHandle<()>>,
}

/// Owns the tasks draining remote tracks. One sink per negotiation session.
#[derive(Clone, Debug, Default)]
pub struct MediaSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl MediaSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if !inner.running {
                debug!("media sink started");
                inner.running = true;
            }
        }
    }

    /// Registers a reader task for a remote track.
    pub fn attach(&self, reader: JoinHandle<()>) {
        match self.inner.lock() {
            Ok(mut inner) => inner.readers.push(reader),
            Err(_) => reader.abort(),
        }
    }

    /// Stops the sink and aborts every reader. Returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let was_active = inner.running || !inner.readers.is_empty();
        for reader in inner.readers.drain(..) {
            reader.abort();
        }
        inner.running = false;
        if was_active {
            debug!("media sink stopped");
        }
        was_active
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().map(|inner| inner.running).unwrap_or(false)
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.readers.len()).unwrap_or(0)
    }
}
