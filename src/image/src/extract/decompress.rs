//! Stream decompression.
//!
//! gzip and bzip2 are decoded in process. xz is handed to an
//! [`ExternalDecoder`], normally the bundled `xz` binary run through the
//! dynamic linker of the tool's own root (see [`XzProcess`]).

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

use acipack_core::config::ToolLayout;
use acipack_core::error::{PackError, Result};

use super::format::DetectedFormat;

/// A decoded byte stream.
pub type DecodedStream = Box<dyn Read + Send>;

/// Decodes a compressed stream outside this process.
pub trait ExternalDecoder: Send + Sync {
    fn decode(&self, input: DecodedStream) -> Result<DecodedStream>;
}

/// Runs the bundled `xz` through the bundled root's dynamic linker.
///
/// The linker is invoked directly (`<root>/<ld_path> <root>/usr/bin/xz
/// --decompress --stdout`) with an environment holding only `PATH` and
/// `LD_LIBRARY_PATH` into the bundled root, so it works from inside a
/// foreign root filesystem.
#[derive(Debug, Clone)]
pub struct XzProcess {
    program: PathBuf,
    xz: PathBuf,
    env: Vec<(String, String)>,
}

impl XzProcess {
    /// `ld_path` is the linker path as found in the tool's ELF interpreter
    /// field (e.g. `/lib64/ld-linux-x86-64.so.2`).
    pub fn new(layout: &ToolLayout, ld_path: Option<&str>) -> Result<Self> {
        let ld_path = ld_path.filter(|p| !p.is_empty()).ok_or_else(|| {
            PackError::FormatError("ld.so path not defined. Cannot extract xz files".to_string())
        })?;

        Ok(Self {
            program: layout.root_dir().join(ld_path.trim_start_matches('/')),
            xz: layout.xz_path(),
            env: layout.decoder_env(),
        })
    }

    /// Run `program first_arg --decompress --stdout` with an empty
    /// environment instead of the linker + xz pair.
    pub fn with_program(program: impl Into<PathBuf>, first_arg: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            xz: first_arg.into(),
            env: Vec::new(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.xz)
            .args(["--decompress", "--stdout"])
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl ExternalDecoder for XzProcess {
    fn decode(&self, mut input: DecodedStream) -> Result<DecodedStream> {
        let mut child = self.command().spawn().map_err(|e| {
            PackError::FormatError(format!(
                "cannot start xz decoder {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PackError::FormatError(
                "xz decoder started without pipes".to_string(),
            ));
        };

        tracing::debug!(program = %self.program.display(), pid = child.id(), "Started xz decoder");

        // Feed from a separate thread so a full stdout pipe can never block
        // the writer side.
        let feeder = std::thread::spawn(move || -> io::Result<u64> {
            let copied = io::copy(&mut input, &mut stdin)?;
            stdin.flush()?;
            Ok(copied)
        });

        Ok(Box::new(ProcessReader {
            child,
            stdout,
            feeder: Some(feeder),
            status: None,
        }))
    }
}

/// Reads a decoder process's stdout. EOF also collects the exit status;
/// a failed process turns EOF into an error.
pub struct ProcessReader {
    child: Child,
    stdout: ChildStdout,
    feeder: Option<JoinHandle<io::Result<u64>>>,
    status: Option<ExitStatus>,
}

impl ProcessReader {
    fn finish(&mut self) -> io::Result<()> {
        let status = match self.status {
            Some(status) => status,
            None => {
                let status = self.child.wait()?;
                self.status = Some(status);
                status
            }
        };

        let fed = match self.feeder.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "feeder panicked"))),
            None => Ok(0),
        };

        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("xz decoder failed: {}", status),
            ));
        }
        match fed {
            // The decoder may stop reading once it has seen the end of the stream
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(io::Error::new(
                e.kind(),
                format!("feeding xz decoder: {}", e),
            )),
            _ => Ok(()),
        }
    }
}

impl Read for ProcessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for ProcessReader {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        // A feeder still blocked on the input gets EPIPE once the child is
        // gone; it is left to finish on its own.
        self.feeder.take();
    }
}

/// Turns a detected format into a decoded stream.
#[derive(Clone, Default)]
pub struct Decompressor {
    external: Option<Arc<dyn ExternalDecoder>>,
}

impl Decompressor {
    /// A decompressor without xz support.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external(mut self, decoder: Arc<dyn ExternalDecoder>) -> Self {
        self.external = Some(decoder);
        self
    }

    /// The bundled xz when the linker path is known; otherwise xz input is
    /// rejected when encountered.
    pub fn for_layout(layout: &ToolLayout, ld_path: Option<&str>) -> Self {
        match XzProcess::new(layout, ld_path) {
            Ok(xz) => Self::new().with_external(Arc::new(xz)),
            Err(_) => Self::new(),
        }
    }

    pub fn decompress(&self, input: DecodedStream, format: DetectedFormat) -> Result<DecodedStream> {
        tracing::debug!(format = %format, "Decompressing image");

        match format {
            DetectedFormat::Gzip => Ok(Box::new(MultiGzDecoder::new(input))),
            DetectedFormat::Bzip2 => Ok(Box::new(MultiBzDecoder::new(input))),
            DetectedFormat::Tar => Ok(input),
            DetectedFormat::Xz => match &self.external {
                Some(decoder) => decoder.decode(input),
                None => Err(PackError::FormatError(
                    "ld.so path not defined. Cannot extract xz files".to_string(),
                )),
            },
            DetectedFormat::Unknown => {
                Err(PackError::FormatError("unknown image filetype".to_string()))
            }
        }
    }
}
