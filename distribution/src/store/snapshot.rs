//! Durable copy of the in-memory store, so a restart does not lose release
//! history.
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Clone, Debug)]
enum Compression {
    #[allow(dead_code)]
    None,
    // zstd with compression level
    Zstd(i32),
}

struct Codec {
    compression: Compression,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec {
            compression,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    fn write<W: Write, T: Serialize>(&self, writer: &mut W, data: &T) -> Result<usize, SnapshotError> {
        match self.compression {
            Compression::None => {
                let size = bincode::serde::encode_into_std_write(data, writer, self.config)?;
                writer.flush()?;
                Ok(size)
            }
            Compression::Zstd(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                let size = bincode::serde::encode_into_std_write(data, &mut encoder, self.config)?;
                encoder.finish()?.flush()?;
                Ok(size)
            }
        }
    }

    fn read<R: Read, T: DeserializeOwned>(&self, mut reader: R) -> Result<T, SnapshotError> {
        match self.compression {
            Compression::None => Ok(bincode::serde::decode_from_std_read(&mut reader, self.config)?),
            Compression::Zstd(_) => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                Ok(bincode::serde::decode_from_std_read(&mut decoder, self.config)?)
            }
        }
    }
}

/// A single snapshot file. Writes go to a sibling temp file which is renamed
/// over the previous snapshot, so a crash mid-write leaves the old one intact.
pub struct Snapshot {
    path: PathBuf,
    codec: Codec,
}

impl Snapshot {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Snapshot {
            path: path.as_ref().to_path_buf(),
            codec: Codec::new(Compression::Zstd(1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, SnapshotError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.codec.read(io::BufReader::new(file)).map(Some)
    }

    pub fn store<T: Serialize>(&self, data: &T) -> Result<usize, SnapshotError> {
        let tmp = self.path.with_extension("tmp");
        let mut writer = io::BufWriter::new(File::create(&tmp)?);
        let size = self.codec.write(&mut writer, data)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), bytes = size, "stored snapshot");
        Ok(size)
    }
}
