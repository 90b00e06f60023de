use ts::TsPacket;

use crate::Result;
use crate::context::StageHandle;

/// Verdict of a processor for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Keep the packet (possibly modified in place).
    Ok,
    /// Replace the packet with a null packet.
    Null,
    /// Remove the packet from the stream.
    Drop,
    /// Terminate the whole pipeline after this packet.
    End,
}

/// Per-packet feedback from a processor to the runtime.
#[derive(Debug, Default)]
pub struct PacketFeedback {
    /// Release the current batch downstream immediately.
    pub flush: bool,
    /// The stage changed something that affects the TS bitrate.
    pub bitrate_changed: bool,
}

/// A packet processor stage.
///
/// `process` is called once per packet, in stream order, on the stage's own
/// thread. State lives in the implementing struct; the handle gives access
/// to pipeline-wide facilities (bitrate, joint termination, cancellation).
pub trait PacketProcessor: Send {
    fn name(&self) -> &'static str;

    /// Called once before any packet flows. A failure aborts the pipeline.
    fn start(&mut self, handle: &StageHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }

    fn process(
        &mut self,
        handle: &StageHandle,
        pkt: &mut TsPacket,
        feedback: &mut PacketFeedback,
    ) -> Result<PacketStatus>;

    /// Called once when the stage winds down.
    fn stop(&mut self, handle: &StageHandle) {
        let _ = handle;
    }
}

/// An input stage: produces packets into the pipeline.
pub trait PacketInput: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, handle: &StageHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }

    /// Fill `buf` with packets; return how many were produced. Returning 0
    /// reports end of input.
    fn receive(&mut self, handle: &StageHandle, buf: &mut [TsPacket]) -> Result<usize>;

    /// Input bitrate in b/s when the source knows it (0 = unknown).
    fn bitrate(&self) -> u64 {
        0
    }

    fn stop(&mut self, handle: &StageHandle) {
        let _ = handle;
    }
}

impl<T: PacketProcessor + ?Sized> PacketProcessor for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn start(&mut self, handle: &StageHandle) -> Result<()> {
        (**self).start(handle)
    }

    fn process(
        &mut self,
        handle: &StageHandle,
        pkt: &mut TsPacket,
        feedback: &mut PacketFeedback,
    ) -> Result<PacketStatus> {
        (**self).process(handle, pkt, feedback)
    }

    fn stop(&mut self, handle: &StageHandle) {
        (**self).stop(handle)
    }
}

impl<T: PacketInput + ?Sized> PacketInput for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn start(&mut self, handle: &StageHandle) -> Result<()> {
        (**self).start(handle)
    }

    fn receive(&mut self, handle: &StageHandle, buf: &mut [TsPacket]) -> Result<usize> {
        (**self).receive(handle, buf)
    }

    fn bitrate(&self) -> u64 {
        (**self).bitrate()
    }

    fn stop(&mut self, handle: &StageHandle) {
        (**self).stop(handle)
    }
}

/// An output stage: drains packets out of the pipeline.
pub trait PacketOutput: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, handle: &StageHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }

    fn send(&mut self, handle: &StageHandle, packets: &[TsPacket]) -> Result<()>;

    fn stop(&mut self, handle: &StageHandle) {
        let _ = handle;
    }
}

impl<T: PacketOutput + ?Sized> PacketOutput for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn start(&mut self, handle: &StageHandle) -> Result<()> {
        (**self).start(handle)
    }

    fn send(&mut self, handle: &StageHandle, packets: &[TsPacket]) -> Result<()> {
        (**self).send(handle, packets)
    }

    fn stop(&mut self, handle: &StageHandle) {
        (**self).stop(handle)
    }
}
