//! Model formats and the loader seam.
//!
//! Format-specific deserialization lives behind [`ModelFormatLoader`]. The
//! built-in [`PassthroughLoader`] keeps the verified plaintext in locked,
//! zeroizing memory and performs only a magic-byte sanity check.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Pytorch,
    Tensorflow,
    Onnx,
    Gguf,
    Safetensors,
    /// Opaque bytes, no validation.
    Raw,
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelFormat::Pytorch => "pytorch",
            ModelFormat::Tensorflow => "tensorflow",
            ModelFormat::Onnx => "onnx",
            ModelFormat::Gguf => "gguf",
            ModelFormat::Safetensors => "safetensors",
            ModelFormat::Raw => "raw",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ModelFormat {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pytorch" | "torch" | "pt" => Ok(ModelFormat::Pytorch),
            "tensorflow" | "tf" => Ok(ModelFormat::Tensorflow),
            "onnx" => Ok(ModelFormat::Onnx),
            "gguf" => Ok(ModelFormat::Gguf),
            "safetensors" => Ok(ModelFormat::Safetensors),
            "raw" => Ok(ModelFormat::Raw),
            other => Err(VaultError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl ModelFormat {
    /// Guess the format from a (possibly `.encrypted`) artifact file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let name = name.strip_suffix(".encrypted").unwrap_or(name);
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pt" | "pth" | "bin" => Some(ModelFormat::Pytorch),
            "pb" | "h5" => Some(ModelFormat::Tensorflow),
            "onnx" => Some(ModelFormat::Onnx),
            "gguf" => Some(ModelFormat::Gguf),
            "safetensors" => Some(ModelFormat::Safetensors),
            _ => None,
        }
    }
}

/// Verified plaintext handed to a loader, as bytes and as a scratch file.
#[derive(Debug)]
pub struct PlaintextArtifact<'a> {
    pub name: &'a str,
    pub bytes: &'a [u8],
    /// Owner-only scratch copy, erased as soon as `load` returns.
    pub path: &'a Path,
}

/// Turns verified plaintext into an owned, format-specific handle.
///
/// Fails with `UnsupportedFormat` or `Corrupt`. The loader must not keep
/// references to `artifact.path`; the file is erased after the call.
pub trait ModelFormatLoader: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn load(&self, format: ModelFormat, artifact: &PlaintextArtifact<'_>) -> Result<Self::Handle>;
}

/// Plaintext model held in locked memory, zeroized on drop.
#[derive(Debug)]
pub struct LockedModel {
    data: zeroize::Zeroizing<Vec<u8>>,
    pub name: String,
    pub format: ModelFormat,
}

impl LockedModel {
    fn new(name: &str, format: ModelFormat, bytes: &[u8]) -> Self {
        let data = zeroize::Zeroizing::new(bytes.to_vec());
        if let Err(e) = mlock_bytes(&data) {
            tracing::warn!(error = %e, model = %name, "mlock failed, plaintext may be swapped to disk");
        }
        Self {
            data,
            name: name.to_string(),
            format,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for LockedModel {
    fn drop(&mut self) {
        munlock_bytes(&self.data);
        tracing::debug!(model = %self.name, "Zeroized and unlocked in-memory model");
    }
}

/// Loader that keeps the plaintext as a [`LockedModel`].
#[derive(Debug, Default, Clone)]
pub struct PassthroughLoader {
    /// Accepted formats. Empty accepts all.
    formats: HashSet<ModelFormat>,
}

impl PassthroughLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_formats(formats: impl IntoIterator<Item = ModelFormat>) -> Self {
        Self {
            formats: formats.into_iter().collect(),
        }
    }
}

fn check_magic(format: ModelFormat, bytes: &[u8]) -> std::result::Result<(), &'static str> {
    match format {
        ModelFormat::Gguf if !bytes.starts_with(b"GGUF") => Err("missing GGUF magic"),
        // TorchScript/zip archives or a legacy pickle stream.
        ModelFormat::Pytorch if !(bytes.starts_with(b"PK\x03\x04") || bytes.first() == Some(&0x80)) => {
            Err("not a zip archive or pickle stream")
        }
        ModelFormat::Safetensors => {
            let header_len = bytes
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or("truncated safetensors header")?;
            if header_len.saturating_add(8) > bytes.len() as u64 {
                Err("safetensors header length exceeds file size")
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

impl ModelFormatLoader for PassthroughLoader {
    type Handle = LockedModel;

    fn load(&self, format: ModelFormat, artifact: &PlaintextArtifact<'_>) -> Result<LockedModel> {
        if !self.formats.is_empty() && !self.formats.contains(&format) {
            return Err(VaultError::UnsupportedFormat(format!(
                "{format} is not enabled for this loader"
            )));
        }
        check_magic(format, artifact.bytes)
            .map_err(|reason| VaultError::Corrupt(format!("{}: {reason}", artifact.name)))?;
        Ok(LockedModel::new(artifact.name, format, artifact.bytes))
    }
}

/// Lock memory pages to prevent swapping to disk.
///
/// On Linux, calls `mlock(2)`. On other platforms, this is a no-op.
fn mlock_bytes(data: &[u8]) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        if data.is_empty() {
            return Ok(());
        }
        // Safety: pointer and length come from a live slice.
        let ret = unsafe { libc::mlock(data.as_ptr() as *const libc::c_void, data.len()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = data;
    }
    Ok(())
}

/// Unlock memory pages previously locked with mlock.
fn munlock_bytes(data: &[u8]) {
    #[cfg(target_os = "linux")]
    {
        if data.is_empty() {
            return;
        }
        // Safety: pointer and length come from a live slice.
        unsafe {
            libc::munlock(data.as_ptr() as *const libc::c_void, data.len());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = data;
    }
}
