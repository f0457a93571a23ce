//! File transfer and filesystem edits over a raw REPL session.

use replink_proto::{ChunkEncoding, decode_hex, encode_chunk, hexlify, script};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use super::RawRepl;
use crate::{Error, Result};

/// How [`RawRepl::write_file`] transfers data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct WriteOptions {
    /// Bytes per `exec`.
    pub chunk_size: usize,
    /// Write the destination in place instead of through a temporary file.
    pub direct: bool,
    /// Compare SHA-256 digests after writing.
    pub verify: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            direct: false,
            verify: false,
        }
    }
}

impl RawRepl<'_> {
    /// Reads a whole file from the device.
    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let hex = self.exec(&script::read_file(path)).await?;
        let data = decode_hex(&hex)?;
        debug!(path, bytes = data.len(), "read file");
        Ok(data)
    }

    /// Writes `data` to `path`, replacing any existing file.
    ///
    /// Unless `direct` is set the data lands in a sibling temporary file that
    /// is renamed over `path` at the end, so a failure mid-way leaves the
    /// destination untouched.
    pub async fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<()> {
        if options.chunk_size == 0 {
            return Err(Error::InvalidState("chunk size must be positive"));
        }
        let temp = (!options.direct).then(|| script::temp_path_for(path));
        let dest = temp.as_deref().unwrap_or(path);

        self.exec(&script::write_prelude(dest)).await?;
        if let Err(e) = self.send_chunks(data, options.chunk_size).await {
            if let Err(err) = self.exec(script::ABORT_WRITE).await {
                warn!(path, error = %err, "closing aborted write failed");
            }
            return Err(e);
        }
        self.exec(&script::write_epilogue(path, temp.as_deref())).await?;
        debug!(path, bytes = data.len(), direct = options.direct, "wrote file");

        if options.verify {
            self.verify(path, data).await?;
        }
        Ok(())
    }

    /// Sends one `exec` per chunk.
    async fn send_chunks(&mut self, data: &[u8], chunk_size: usize) -> Result<()> {
        for chunk in data.chunks(chunk_size) {
            let (encoding, stmt) = encode_chunk(chunk);
            trace!(bytes = chunk.len(), hex = encoding == ChunkEncoding::Hex, "chunk");
            self.exec(&stmt).await?;
        }
        Ok(())
    }

    /// Compares the device's digest of `path` with the digest of `data`.
    async fn verify(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let Some(remote) = self.file_sha256(path).await? else {
            warn!(path, "device has no hashlib, skipping verification");
            return Ok(());
        };
        let local = hexlify(Sha256::digest(data).as_slice());
        if remote != local {
            return Err(Error::ProtocolViolation(format!(
                "checksum mismatch for {path}: device {remote}, host {local}"
            )));
        }
        debug!(path, "checksum verified");
        Ok(())
    }

    /// Hex SHA-256 of a file, `None` when the firmware lacks `hashlib`.
    pub async fn file_sha256(&mut self, path: &str) -> Result<Option<String>> {
        let out = self.exec(&script::sha256(path)).await?;
        let out = out.trim();
        Ok((out != script::NO_HASHLIB).then(|| out.to_owned()))
    }

    /// Creates an empty file if missing. Existing content is kept.
    pub async fn touch_file(&mut self, path: &str) -> Result<()> {
        self.exec(&script::touch(path)).await.map(drop)
    }

    /// Creates a directory and its missing parents.
    pub async fn make_path(&mut self, path: &str) -> Result<()> {
        self.exec(&script::make_path(path)).await.map(drop)
    }

    /// Removes a file.
    pub async fn remove_file(&mut self, path: &str) -> Result<()> {
        self.exec(&script::remove_file(path)).await.map(drop)
    }

    /// Removes an empty directory.
    pub async fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.exec(&script::remove_dir(path)).await.map(drop)
    }
}
