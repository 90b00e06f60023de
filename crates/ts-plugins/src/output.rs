//! Output plugins: `file` and `drop`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use ts::TsPacket;
use ts_pipeline::{PacketOutput, PipelineError, StageHandle};

enum Sink {
    File(BufWriter<File>),
    Stdout(std::io::Stdout),
}

/// Writes packets to a file, or to standard output when no path is given.
pub struct FileOutput {
    path: Option<PathBuf>,
    append: bool,
    sink: Option<Sink>,
}

impl FileOutput {
    pub fn new(path: Option<PathBuf>) -> Self {
        FileOutput {
            path,
            append: false,
            sink: None,
        }
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

impl PacketOutput for FileOutput {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&mut self, _handle: &StageHandle) -> ts_pipeline::Result<()> {
        self.sink = Some(match &self.path {
            Some(path) => {
                let file = File::options()
                    .write(true)
                    .create(true)
                    .append(self.append)
                    .truncate(!self.append)
                    .open(path)?;
                Sink::File(BufWriter::new(file))
            }
            None => Sink::Stdout(std::io::stdout()),
        });
        Ok(())
    }

    fn send(&mut self, _handle: &StageHandle, packets: &[TsPacket]) -> ts_pipeline::Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| PipelineError::Processing("file output not started".into()))?;
        for pkt in packets {
            match sink {
                Sink::File(writer) => writer.write_all(pkt.as_bytes())?,
                Sink::Stdout(stdout) => stdout.write_all(pkt.as_bytes())?,
            }
        }
        Ok(())
    }

    fn stop(&mut self, _handle: &StageHandle) {
        if let Some(Sink::File(writer)) = &mut self.sink {
            let _ = writer.flush();
        }
        self.sink = None;
    }
}

/// Discards every packet.
#[derive(Default)]
pub struct DropOutput;

impl PacketOutput for DropOutput {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn send(&mut self, _handle: &StageHandle, _packets: &[TsPacket]) -> ts_pipeline::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts::packet::test_support::payload_packet;
    use ts_pipeline::test_utils::create_test_handle;

    #[test]
    fn test_file_output_writes_packets() {
        let handle = create_test_handle(0);
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut output = FileOutput::new(Some(file.path().to_path_buf()));
        output.start(&handle).unwrap();
        let packets: Vec<TsPacket> = (0..3).map(|i| payload_packet(0x42, i)).collect();
        output.send(&handle, &packets).unwrap();
        output.stop(&handle);

        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(written.len(), 3 * 188);
        assert_eq!(&written[..188], payload_packet(0x42, 0).as_bytes());
    }
}
