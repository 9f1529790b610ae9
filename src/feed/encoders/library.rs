use std::{
    ffi::{c_int, c_void},
    fmt,
    path::{Path, PathBuf},
};

use libloading::Library;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::feed::error::SessionError;

static LOADED: OnceCell<CodecLibrary> = OnceCell::new();

pub const REQUIRED_VERSION: CodecVersion = CodecVersion {
    major: 2,
    minor: 0,
    revision: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CodecVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl fmt::Display for CodecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

#[repr(C)]
#[derive(Default)]
struct RawVersion {
    major: u32,
    minor: u32,
    revision: u32,
    reserved: u32,
}

type CreateEncoderFn = unsafe extern "C" fn(*mut *mut c_void) -> c_int;
type GetVersionFn = unsafe extern "C" fn(*mut RawVersion);

/// A shared codec library, opened at most once per process.
pub struct CodecLibrary {
    path: PathBuf,
    version: CodecVersion,
    _lib: Library,
}

impl fmt::Debug for CodecLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecLibrary")
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

impl CodecLibrary {
    /// Load and validate the library at `path`. Concurrent callers block until
    /// the first load finishes; a failed load leaves nothing behind, so a later
    /// call may retry.
    pub fn load(path: &Path) -> Result<&'static CodecLibrary, SessionError> {
        let library = LOADED.get_or_try_init(|| Self::open(path))?;
        if library.path != path {
            warn!(
                loaded = %library.path.display(),
                requested = %path.display(),
                "codec library already loaded from another path, reusing it"
            );
        }
        Ok(library)
    }

    /// The library loaded so far, if any.
    pub fn loaded() -> Option<&'static CodecLibrary> {
        LOADED.get()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> CodecVersion {
        self.version
    }

    fn open(path: &Path) -> Result<Self, SessionError> {
        // SAFETY: loading a codec library the operator pointed us at; its
        // initialisers only register codec entry points.
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            SessionError::CodecUnavailable(format!("failed to load {}: {e}", path.display()))
        })?;

        let version = {
            // SAFETY: symbol signatures follow the codec's public C header.
            let _create = unsafe { lib.get::<CreateEncoderFn>(b"WelsCreateSVCEncoder\0") }
                .map_err(|e| {
                    SessionError::CodecUnavailable(format!("WelsCreateSVCEncoder: {e}"))
                })?;
            let get_version = unsafe { lib.get::<GetVersionFn>(b"WelsGetCodecVersionEx\0") }
                .map_err(|e| {
                    SessionError::CodecUnavailable(format!("WelsGetCodecVersionEx: {e}"))
                })?;

            let mut raw = RawVersion::default();
            unsafe { get_version(&mut raw) };
            CodecVersion {
                major: raw.major,
                minor: raw.minor,
                revision: raw.revision,
            }
        };

        check_version(version, REQUIRED_VERSION)?;
        info!(path = %path.display(), %version, "codec library loaded");

        Ok(Self {
            path: path.to_owned(),
            version,
            _lib: lib,
        })
    }
}

fn check_version(found: CodecVersion, required: CodecVersion) -> Result<(), SessionError> {
    if found < required {
        return Err(SessionError::DriverTooOld {
            found: found.to_string(),
            required: required.to_string(),
        });
    }
    Ok(())
}
