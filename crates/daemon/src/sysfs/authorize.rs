//! The privileged sysfs writes.
//!
//! Writing `1` to a device's `authorized` attribute grants it access to the
//! bus. A failure here must always reach the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::IntoRawFd;
use std::path::Path;

use model::{Device, Error, Result};
use tracing::{debug, info};

/// Byte written to the `authorized` attribute.
const AUTHORIZE_BYTE: u8 = b'1';

/// Grants bus access to an attached device.
///
/// Opens `<sysfs>/authorized`, writes exactly one `'1'` byte (retrying only
/// on `EINTR`) and closes the handle, checking the close result as well.
pub fn authorize(device: &Device) -> Result<()> {
    let syspath = device
        .sysfs_path()
        .ok_or_else(|| Error::not_found(format!("sysfs directory of {}", device.uid())))?;
    let path = syspath.join("authorized");

    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;

    write_one_byte(&mut file, AUTHORIZE_BYTE)
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;

    close(file).map_err(|e| Error::io(format!("closing {}", path.display()), e))?;

    info!("Authorized device {} ({})", device.uid(), device.device_name);
    Ok(())
}

/// Writes a single byte, retrying on interrupt only.
///
/// Anything other than exactly one byte written is an error; a zero-byte
/// write is not retried.
pub(crate) fn write_one_byte<W: Write>(writer: &mut W, byte: u8) -> io::Result<()> {
    loop {
        match writer.write(&[byte]) {
            Ok(1) => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("wrote {} bytes, expected 1", n),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("Write interrupted, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Closes a file and reports the result of `close(2)`.
fn close(file: File) -> io::Result<()> {
    let fd = file.into_raw_fd();
    nix::unistd::close(fd).map_err(io::Error::from)
}

/// Checks that `reader` starts with the bytes of `uid`.
///
/// Only `uid.len()` bytes are read, so a trailing newline in a sysfs
/// attribute does not matter. This is a prefix check: an attribute holding
/// `"AB"` passes for uid `"A"`. Kernel unique ids are fixed-length UUIDs,
/// so a reused device directory still fails unless the new id starts with
/// the old one.
pub fn verify_uid<R: Read>(reader: &mut R, uid: &str) -> Result<()> {
    let mut buffer = vec![0u8; uid.len()];

    reader.read_exact(&mut buffer).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::io(
                "verifying unique id",
                io::Error::new(io::ErrorKind::InvalidData, "could not read full uid"),
            )
        } else {
            Error::io("reading unique id", e)
        }
    })?;

    if buffer != uid.as_bytes() {
        return Err(Error::io(
            "verifying unique id",
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unique id verification failed [{} != {}]",
                    String::from_utf8_lossy(&buffer),
                    uid
                ),
            ),
        ));
    }

    Ok(())
}

/// Verifies that the device directory still belongs to this device.
pub fn verify_device_uid(device: &Device) -> Result<()> {
    let syspath = device
        .sysfs_path()
        .ok_or_else(|| Error::not_found(format!("sysfs directory of {}", device.uid())))?;
    verify_uid_at(syspath, device.uid())
}

fn verify_uid_at(syspath: &Path, uid: &str) -> Result<()> {
    let path = syspath.join("unique_id");
    let mut file =
        File::open(&path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    verify_uid(&mut file, uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Writer that replays scripted results.
    struct ScriptedWriter {
        results: Vec<io::Result<usize>>,
        calls: usize,
    }

    impl ScriptedWriter {
        fn new(results: Vec<io::Result<usize>>) -> Self {
            Self { results, calls: 0 }
        }
    }

    impl Write for ScriptedWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.results.is_empty() {
                panic!("unexpected write");
            }
            self.results.remove(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn attached_device(dir: &Path, uid: &str) -> Device {
        let mut dev = Device::new(uid);
        dev.sysfs_path = Some(dir.to_path_buf());
        dev
    }

    #[test]
    fn test_write_one_byte_success() {
        let mut writer = ScriptedWriter::new(vec![Ok(1)]);
        write_one_byte(&mut writer, b'1').unwrap();
        assert_eq!(writer.calls, 1);
    }

    #[test]
    fn test_write_one_byte_retries_on_interrupt() {
        let mut writer = ScriptedWriter::new(vec![
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(1),
        ]);
        write_one_byte(&mut writer, b'1').unwrap();
        assert_eq!(writer.calls, 3);
    }

    #[test]
    fn test_write_one_byte_zero_write_fails_without_retry() {
        let mut writer = ScriptedWriter::new(vec![Ok(0)]);
        let err = write_one_byte(&mut writer, b'1').unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(writer.calls, 1);
    }

    #[test]
    fn test_write_one_byte_other_error() {
        let mut writer = ScriptedWriter::new(vec![Err(io::Error::from_raw_os_error(5))]);
        let err = write_one_byte(&mut writer, b'1').unwrap_err();
        assert_eq!(err.raw_os_error(), Some(5));
        assert_eq!(writer.calls, 1);
    }

    #[test]
    fn test_authorize_writes_single_byte() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("authorized"), "0\n").unwrap();

        let dev = attached_device(temp_dir.path(), "abc");
        authorize(&dev).unwrap();

        let contents = fs::read(temp_dir.path().join("authorized")).unwrap();
        assert_eq!(contents[0], b'1');
    }

    #[test]
    fn test_authorize_missing_node_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let dev = attached_device(&temp_dir.path().join("vanished"), "abc");

        let err = authorize(&dev).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.raw_os_error(), Some(2));
    }

    #[test]
    fn test_authorize_detached_device() {
        let dev = Device::new("abc");
        assert!(authorize(&dev).unwrap_err().is_not_found());
    }

    #[test]
    fn test_verify_uid_match() {
        let mut reader = Cursor::new(b"abc-123\n".to_vec());
        verify_uid(&mut reader, "abc-123").unwrap();
    }

    #[test]
    fn test_verify_uid_mismatch() {
        let mut reader = Cursor::new(b"xyz-999\n".to_vec());
        let err = verify_uid(&mut reader, "abc-123").unwrap_err();
        assert!(err.to_string().contains("verification failed"));
    }

    #[test]
    fn test_verify_uid_is_prefix_check() {
        let mut reader = Cursor::new(b"AB\n".to_vec());
        verify_uid(&mut reader, "A").unwrap();

        let mut reader = Cursor::new(b"BA\n".to_vec());
        assert!(verify_uid(&mut reader, "A").is_err());
    }

    #[test]
    fn test_verify_uid_short_read() {
        let mut reader = Cursor::new(b"abc".to_vec());
        let err = verify_uid(&mut reader, "abc-123").unwrap_err();
        assert!(err.to_string().contains("could not read full uid"));
    }

    #[test]
    fn test_verify_device_uid() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("unique_id"), "abc-123\n").unwrap();

        verify_device_uid(&attached_device(temp_dir.path(), "abc-123")).unwrap();
        assert!(verify_device_uid(&attached_device(temp_dir.path(), "other-1")).is_err());
    }
}
