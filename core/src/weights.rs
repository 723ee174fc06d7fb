//! Binary weight files.
//!
//! ```text
//! i32 major | i32 minor | i32 revision | seen (u32 or u64)
//! then, per convolutional layer in order:
//!   biases[n] | scales[n] rolling_mean[n] rolling_variance[n] (batch-norm only) | weights
//! ```
//!
//! Every value is host-endian; there are no length prefixes, so the network
//! must be built before it can be loaded.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::error::{NetError, NetResult};
use crate::model::Network;

/// Width of the `seen` counter, fixed by the header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// `major * 10 + minor < 2`: 32-bit counter.
    Legacy,
    /// 64-bit counter.
    Current,
}

impl FormatVersion {
    pub fn from_header(major: i32, minor: i32) -> Self {
        if i64::from(major) * 10 + i64::from(minor) < 2 {
            Self::Legacy
        } else {
            Self::Current
        }
    }

    /// Bytes occupied by the `seen` counter.
    pub const fn seen_width(self) -> usize {
        match self {
            Self::Legacy => std::mem::size_of::<u32>(),
            Self::Current => std::mem::size_of::<u64>(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightHeader {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    /// Images seen during training.
    pub seen: u64,
}

impl WeightHeader {
    /// Header written by [`Network::save_weights`].
    pub const CURRENT: (i32, i32, i32) = (0, 2, 0);

    pub fn version(&self) -> FormatVersion {
        FormatVersion::from_header(self.major, self.minor)
    }
}

/// Outcome of a load: a short file is reported here, not as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub header: WeightHeader,
    /// Convolutional layers whose parameters were fully read.
    pub layers_loaded: usize,
    /// The source ended before every requested layer was read.
    pub truncated: bool,
}

/// Reads a header followed by flat runs of `f32`.
pub struct WeightStore<R> {
    reader: R,
    header: WeightHeader,
    staging: Vec<f32>,
}

/// Fill `buf` until it is full or the reader hits end of data.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<R: Read> WeightStore<R> {
    /// Read and resolve the header. A short header is fatal.
    pub fn open(mut reader: R) -> NetResult<Self> {
        let mut version = [0i32; 3];
        let bytes = bytemuck::bytes_of_mut(&mut version);
        let expected = bytes.len();
        let read = read_full(&mut reader, bytes)?;
        if read < expected {
            return Err(NetError::TruncatedHeader { read, expected });
        }
        let [major, minor, revision] = version;

        let format = FormatVersion::from_header(major, minor);
        let seen = match format {
            FormatVersion::Legacy => {
                let mut seen = 0u32;
                let read_seen = read_full(&mut reader, bytemuck::bytes_of_mut(&mut seen))?;
                if read_seen < format.seen_width() {
                    return Err(NetError::TruncatedHeader {
                        read: read + read_seen,
                        expected: expected + format.seen_width(),
                    });
                }
                u64::from(seen)
            }
            FormatVersion::Current => {
                let mut seen = 0u64;
                let read_seen = read_full(&mut reader, bytemuck::bytes_of_mut(&mut seen))?;
                if read_seen < format.seen_width() {
                    return Err(NetError::TruncatedHeader {
                        read: read + read_seen,
                        expected: expected + format.seen_width(),
                    });
                }
                seen
            }
        };
        debug!(major, minor, revision, seen, ?format, "weight header");

        Ok(Self {
            reader,
            header: WeightHeader { major, minor, revision, seen },
            staging: Vec::new(),
        })
    }

    pub fn header(&self) -> WeightHeader {
        self.header
    }

    /// Read the next `len` floats. Returns `None` if the source ends first.
    pub fn read_run(&mut self, len: usize) -> NetResult<Option<&[f32]>> {
        self.staging.clear();
        self.staging.resize(len, 0.0);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.staging);
        let expected = bytes.len();
        if read_full(&mut self.reader, bytes)? < expected {
            return Ok(None);
        }
        Ok(Some(&self.staging))
    }
}

impl Network {
    /// Load every convolutional layer from `reader`.
    pub fn load_weights<R: Read>(&mut self, reader: R) -> NetResult<LoadReport> {
        self.load_weights_upto(reader, usize::MAX)
    }

    /// Load parameters for layers `0..min(len, cutoff)`.
    ///
    /// Only convolutional layers consume data. If the source ends early,
    /// layers already read keep their values and the rest stay untouched.
    #[instrument(skip_all, level = "debug", fields(cutoff = cutoff))]
    pub fn load_weights_upto<R: Read>(&mut self, reader: R, cutoff: usize) -> NetResult<LoadReport> {
        let mut store = WeightStore::open(reader)?;
        let header = store.header();
        self.set_seen(header.seen);

        let mut layers_loaded = 0;
        let mut truncated = false;
        let end = cutoff.min(self.len());
        for (index, layer) in self.layers_mut()[..end].iter_mut().enumerate() {
            let Some(conv) = layer.as_convolutional_mut() else {
                continue;
            };
            match store.read_run(conv.parameter_count())? {
                Some(flat) => {
                    conv.assign_parameters(flat);
                    layers_loaded += 1;
                }
                None => {
                    warn!(index, layers_loaded, "weight data ended early, stopping load");
                    truncated = true;
                    break;
                }
            }
        }
        info!("Loaded {layers_loaded} layers (seen {})", header.seen);
        Ok(LoadReport { header, layers_loaded, truncated })
    }

    /// Open `path` and load up to `cutoff` layers from it.
    pub fn load_weights_file(&mut self, path: impl AsRef<Path>, cutoff: usize) -> NetResult<LoadReport> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| NetError::WeightSource {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loading weights from {}...", path.display());
        self.load_weights_upto(BufReader::new(file), cutoff)
    }

    /// Write the current header and every convolutional layer's parameters.
    pub fn save_weights<W: Write>(&self, mut writer: W) -> NetResult<()> {
        let (major, minor, revision) = WeightHeader::CURRENT;
        writer.write_all(bytemuck::cast_slice(&[major, minor, revision]))?;
        writer.write_all(bytemuck::bytes_of(&self.seen()))?;

        let mut flat = Vec::new();
        for conv in self.layers().iter().filter_map(|l| l.as_convolutional()) {
            flat.clear();
            conv.extend_parameters(&mut flat);
            writer.write_all(bytemuck::cast_slice(&flat))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn save_weights_file(&self, path: impl AsRef<Path>) -> NetResult<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| NetError::WeightSource {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saving weights to {}", path.display());
        self.save_weights(BufWriter::new(file))
    }
}
