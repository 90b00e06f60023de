use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;
use ts::clock::PKT_SIZE;
use ts::TsPacket;

/// Reader over a binary file of concatenated 188-byte TS packets.
///
/// Supports a start offset in bytes and a repeat count: when the end of the
/// file is reached, the reader seeks back to the start offset for the next
/// pass. A repeat count of 0 replays the file forever.
pub struct TsFileReader {
    path: PathBuf,
    file: File,
    start_offset: u64,
    repeat: usize,
    passes_done: usize,
}

impl TsFileReader {
    /// Open `path`, seeking to `byte_offset` first.
    pub fn open(path: &Path, repeat: usize, byte_offset: u64) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(byte_offset))?;
        debug!(path = %path.display(), repeat, byte_offset, "opened TS file");
        Ok(TsFileReader {
            path: path.to_path_buf(),
            file,
            start_offset: byte_offset,
            repeat,
            passes_done: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next packet, replaying the file as configured.
    ///
    /// `Ok(None)` means every pass has been played out.
    pub fn read_packet(&mut self) -> std::io::Result<Option<TsPacket>> {
        let mut buf = [0u8; PKT_SIZE];
        loop {
            match read_full(&mut self.file, &mut buf)? {
                0 => {
                    self.passes_done += 1;
                    if self.repeat != 0 && self.passes_done >= self.repeat {
                        return Ok(None);
                    }
                    self.file.seek(SeekFrom::Start(self.start_offset))?;
                    // An empty file would spin here forever
                    if self.file.metadata()?.len() <= self.start_offset {
                        return Ok(None);
                    }
                }
                PKT_SIZE => {
                    let pkt = TsPacket::from_bytes(&buf).map_err(|err| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
                    })?;
                    return Ok(Some(pkt));
                }
                partial => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("truncated TS packet ({partial} bytes) in {}", self.path.display()),
                    ));
                }
            }
        }
    }

    /// Fill `buf` with packets; returns the count, 0 at end of the last pass.
    pub fn read_packets(&mut self, buf: &mut [TsPacket]) -> std::io::Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            match self.read_packet()? {
                Some(pkt) => {
                    buf[count] = pkt;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

/// Read exactly `buf.len()` bytes unless EOF intervenes; returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use ts::packet::test_support::payload_packet;

    fn write_ts_file(packets: &[TsPacket]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for pkt in packets {
            file.write_all(pkt.as_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_single_pass() {
        let packets: Vec<TsPacket> = (0..5).map(|i| payload_packet(0x100, i)).collect();
        let file = write_ts_file(&packets);
        let mut reader = TsFileReader::open(file.path(), 1, 0).unwrap();
        let mut buf = vec![TsPacket::null(); 10];
        assert_eq!(reader.read_packets(&mut buf).unwrap(), 5);
        assert_eq!(reader.read_packets(&mut buf).unwrap(), 0);
        assert_eq!(buf[..5], packets[..]);
    }

    #[test]
    fn test_repeat_wraps() {
        let packets: Vec<TsPacket> = (0..3).map(|i| payload_packet(0x100, i)).collect();
        let file = write_ts_file(&packets);
        let mut reader = TsFileReader::open(file.path(), 3, 0).unwrap();
        let mut buf = vec![TsPacket::null(); 20];
        assert_eq!(reader.read_packets(&mut buf).unwrap(), 9);
        assert_eq!(buf[3].cc(), 0);
        assert_eq!(buf[8].cc(), 2);
    }

    #[test]
    fn test_byte_offset_skips_packets() {
        let packets: Vec<TsPacket> = (0..4).map(|i| payload_packet(0x100, i)).collect();
        let file = write_ts_file(&packets);
        let mut reader = TsFileReader::open(file.path(), 1, 2 * PKT_SIZE as u64).unwrap();
        let first = reader.read_packet().unwrap().unwrap();
        assert_eq!(first.cc(), 2);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(payload_packet(0x100, 0).as_bytes()).unwrap();
        file.write_all(&[0x47, 0x00]).unwrap();
        file.flush().unwrap();
        let mut reader = TsFileReader::open(file.path(), 1, 0).unwrap();
        assert!(reader.read_packet().unwrap().is_some());
        assert!(reader.read_packet().is_err());
    }

    #[test]
    fn test_bad_sync_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; PKT_SIZE]).unwrap();
        file.flush().unwrap();
        let mut reader = TsFileReader::open(file.path(), 1, 0).unwrap();
        assert!(reader.read_packet().is_err());
    }
}
