use std::{
    io::{Read, Write},
    path::Path,
    process::{Child, ChildStderr, ChildStdin, Command, Stdio},
    thread::JoinHandle,
};

use rig_camera::Frame;

use crate::{EncoderSpec, Error, FrameEncoder, Result};

/// Encodes frames with an `ffmpeg` child process.
///
/// Raw frames are piped to the child's stdin. The container is written by
/// ffmpeg itself. Its stderr is drained on a separate thread, so a full
/// stderr pipe never stalls the encoder.
pub struct FfmpegEncoder {
    spec: EncoderSpec,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    stderr: Option<StderrReader>,
}

type StderrReader = JoinHandle<std::io::Result<Vec<u8>>>;

/// Read `err` to the end on a new thread.
fn drain_stderr(mut err: ChildStderr) -> std::io::Result<StderrReader> {
    std::thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            let mut buf = Vec::new();
            err.read_to_end(&mut buf)?;
            Ok(buf)
        })
}

fn zq(x: &[&str]) -> Vec<String> {
    x.iter().map(|x| String::from(*x)).collect()
}

impl FfmpegEncoder {
    pub fn spawn(spec: EncoderSpec, codec_args: &'static [&'static str]) -> Result<Self> {
        // Fail here rather than inside the child if the path is not writable.
        std::fs::File::create(&spec.path)?;

        let pix_fmt = if spec.is_color { "rgb24" } else { "gray" };
        let mut args = zq(&[
            "-hide_banner",
            "-nostdin",
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            pix_fmt,
        ]);
        args.push("-video_size".into());
        args.push(format!("{}x{}", spec.width, spec.height));
        args.push("-framerate".into());
        args.push(format!("{}", spec.fps));
        args.extend(zq(&["-i", "-"]));
        args.extend(zq(codec_args));
        args.push(spec.path.display().to_string());

        tracing::debug!("spawning ffmpeg {}", args.join(" "));
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdin not captured"))?;
        let stderr = child.stderr.take().map(drain_stderr).transpose()?;

        Ok(Self {
            spec,
            stdin: Some(stdin),
            child: Some(child),
            stderr,
        })
    }

    /// Everything ffmpeg wrote to stderr. Call after the child has exited.
    fn collected_stderr(&mut self) -> String {
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        match handle.join() {
            Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
            Ok(Err(e)) => format!("<reading stderr failed: {e}>"),
            Err(_) => "<stderr reader panicked>".to_string(),
        }
    }

    /// Collect the exit status of a child which stopped reading input.
    fn died(&mut self) -> Result<Error> {
        self.stdin.take();
        let Some(mut child) = self.child.take() else {
            return Ok(Error::AlreadyDone);
        };
        let status = child.wait()?;
        Ok(Error::FfmpegError {
            status,
            stderr: self.collected_stderr(),
        })
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn path(&self) -> &Path {
        &self.spec.path
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.spec.check_frame(frame)?;
        let stdin = self.stdin.as_mut().ok_or(Error::AlreadyDone)?;
        let n_bytes = frame.stride() * frame.height as usize;
        match stdin.write_all(&frame.data[..n_bytes]) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(self.died()?),
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        // Closing stdin tells ffmpeg to end.
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        let stderr = self.collected_stderr();
        if status.success() {
            Ok(())
        } else {
            Err(Error::FfmpegError { status, stderr })
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.finish() {
                tracing::error!("ffmpeg for {}: {e}", self.spec.path.display());
            }
        }
    }
}

#[cfg(all(test, unix))]
mod test {
    use super::*;

    #[test]
    fn stderr_drained_while_writing() {
        // Fills stderr well past the pipe capacity before reading stdin.
        let mut child = Command::new("sh")
            .args(["-c", "head -c 1000000 /dev/zero >&2; cat >/dev/null"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let reader = drain_stderr(child.stderr.take().unwrap()).unwrap();
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(&vec![0u8; 1_000_000]).unwrap();
        drop(stdin);
        assert!(child.wait().unwrap().success());
        assert_eq!(reader.join().unwrap().unwrap().len(), 1_000_000);
    }
}
