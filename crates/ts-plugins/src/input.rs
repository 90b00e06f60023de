//! Input plugins: `file` and `null`.

use std::path::PathBuf;

use ts::{NULL_PACKET, TsPacket};
use ts_pipeline::{PacketInput, PipelineError, StageHandle};

use crate::file::TsFileReader;

/// Reads a TS file, with optional offset and repeat.
pub struct FileInput {
    path: PathBuf,
    repeat: usize,
    byte_offset: u64,
    reader: Option<TsFileReader>,
}

impl FileInput {
    pub fn new(path: PathBuf) -> Self {
        FileInput {
            path,
            repeat: 1,
            byte_offset: 0,
            reader: None,
        }
    }

    pub fn repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn byte_offset(mut self, offset: u64) -> Self {
        self.byte_offset = offset;
        self
    }
}

impl PacketInput for FileInput {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&mut self, _handle: &StageHandle) -> ts_pipeline::Result<()> {
        self.reader = Some(TsFileReader::open(&self.path, self.repeat, self.byte_offset)?);
        Ok(())
    }

    fn receive(&mut self, _handle: &StageHandle, buf: &mut [TsPacket]) -> ts_pipeline::Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PipelineError::Processing("file input not started".into()))?;
        Ok(reader.read_packets(buf)?)
    }

    fn stop(&mut self, _handle: &StageHandle) {
        self.reader = None;
    }
}

/// Generates null packets.
///
/// With a count and joint termination, the generator votes once the count
/// is reached and keeps producing until the whole pipeline terminates.
pub struct NullInput {
    max_count: u64,
    joint_termination: bool,
    produced: u64,
}

impl NullInput {
    /// Endless generator.
    pub fn new() -> Self {
        NullInput {
            max_count: u64::MAX,
            joint_termination: false,
            produced: 0,
        }
    }

    /// Stop (or vote) after `count` packets.
    pub fn with_count(mut self, count: u64) -> Self {
        self.max_count = count;
        self
    }

    pub fn joint_termination(mut self, on: bool) -> Self {
        self.joint_termination = on;
        self
    }
}

impl Default for NullInput {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketInput for NullInput {
    fn name(&self) -> &'static str {
        "null"
    }

    fn start(&mut self, handle: &StageHandle) -> ts_pipeline::Result<()> {
        if self.joint_termination {
            self.joint_termination = handle.use_joint_termination();
        }
        self.produced = 0;
        Ok(())
    }

    fn receive(&mut self, handle: &StageHandle, buf: &mut [TsPacket]) -> ts_pipeline::Result<usize> {
        if self.produced >= self.max_count {
            if !self.joint_termination {
                return Ok(0);
            }
            // Vote, then keep the stream alive until everyone else is done.
            handle.joint_terminate();
            self.max_count = u64::MAX;
        }
        let remaining = usize::try_from(self.max_count - self.produced).unwrap_or(usize::MAX);
        let count = buf.len().min(remaining);
        for slot in &mut buf[..count] {
            *slot = NULL_PACKET;
        }
        self.produced += count as u64;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts_pipeline::test_utils::create_test_handle;

    #[test]
    fn test_null_input_count() {
        let handle = create_test_handle(0);
        let mut input = NullInput::new().with_count(10);
        input.start(&handle).unwrap();
        let mut buf = vec![TsPacket::null(); 8];
        assert_eq!(input.receive(&handle, &mut buf).unwrap(), 8);
        assert_eq!(input.receive(&handle, &mut buf).unwrap(), 2);
        assert_eq!(input.receive(&handle, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_null_input_joint_termination_keeps_producing() {
        let handle = create_test_handle(0);
        let mut input = NullInput::new().with_count(4).joint_termination(true);
        input.start(&handle).unwrap();
        let mut buf = vec![TsPacket::null(); 4];
        assert_eq!(input.receive(&handle, &mut buf).unwrap(), 4);
        // Past the count: votes and keeps going
        assert_eq!(input.receive(&handle, &mut buf).unwrap(), 4);
        assert_eq!(input.receive(&handle, &mut buf).unwrap(), 4);
    }
}
