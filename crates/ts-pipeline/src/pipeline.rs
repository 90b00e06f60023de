use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, error, info};
use ts::{NULL_PACKET, TsPacket};

use crate::bitrate::BitrateController;
use crate::config::PipelineConfig;
use crate::context::{JointBallot, PipelineShared, StageHandle};
use crate::monitor;
use crate::processor::{PacketFeedback, PacketInput, PacketOutput, PacketProcessor, PacketStatus};
use crate::queue::PacketQueue;
use crate::stuffing::StuffingInjector;
use crate::{CancellationToken, PipelineError, Result};

/// Counters reported after a pipeline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSummary {
    /// Packets produced by the input stage (stuffing included).
    pub packets_in: u64,
    /// Packets delivered to the output stage.
    pub packets_out: u64,
}

/// A staged packet pipeline: one input, any number of processors, one
/// output, each on its own thread.
///
/// ```no_run
/// # use ts_pipeline::{Pipeline, PipelineConfig};
/// # fn demo(input: impl ts_pipeline::PacketInput + 'static,
/// #         output: impl ts_pipeline::PacketOutput + 'static) -> ts_pipeline::Result<()> {
/// let _summary = Pipeline::new(PipelineConfig::default())
///     .input(input)
///     .output(output)
///     .run()?;
/// # Ok(()) }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    input: Option<Box<dyn PacketInput>>,
    processors: Vec<Box<dyn PacketProcessor>>,
    output: Option<Box<dyn PacketOutput>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            config,
            input: None,
            processors: Vec::new(),
            output: None,
        }
    }

    pub fn input<I: PacketInput + 'static>(mut self, input: I) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn add_processor<P: PacketProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn output<O: PacketOutput + 'static>(mut self, output: O) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Run the pipeline to completion.
    ///
    /// Starts every stage in order (a start failure aborts before any packet
    /// flows), spawns the stage threads, and joins them. The first stage
    /// error is returned; clean termination (EOF, `End` status, joint
    /// termination) yields the packet counters.
    pub fn run(self) -> Result<PipelineSummary> {
        self.config.validate()?;
        let mut input = self
            .input
            .ok_or_else(|| PipelineError::Config("pipeline has no input stage".into()))?;
        let mut output = self
            .output
            .ok_or_else(|| PipelineError::Config("pipeline has no output stage".into()))?;
        let mut processors = self.processors;

        let stages = processors.len() + 2;
        let token = CancellationToken::new();
        let shared = Arc::new(PipelineShared {
            name: self.config.name.clone(),
            realtime: self.config.is_realtime(),
            token: token.clone(),
            bitrate: BitrateController::new(
                self.config.bitrate,
                self.config.bitrate_adjust_interval,
            ),
            ballot: JointBallot::new(stages, self.config.ignore_joint_termination),
        });

        // One handle per stage: input, processors…, output.
        let mut handles = Vec::with_capacity(stages);
        handles.push(StageHandle::new(Arc::clone(&shared), 0, input.name()));
        for (i, proc) in processors.iter().enumerate() {
            handles.push(StageHandle::new(Arc::clone(&shared), i + 1, proc.name()));
        }
        handles.push(StageHandle::new(
            Arc::clone(&shared),
            stages - 1,
            output.name(),
        ));

        // Start phase: sequential, before any packet flows.
        Pipeline::start_stages(&mut input, &mut processors, &mut output, &handles)?;
        shared.bitrate.report_input(input.bitrate());

        // Inter-stage queues, splitting the buffer across the boundaries.
        let boundaries = stages - 1;
        let per_queue = (self.config.buffer_packets() / boundaries).max(1);
        let queues: Vec<Arc<PacketQueue>> = (0..boundaries)
            .map(|_| Arc::new(PacketQueue::new(per_queue, token.clone())))
            .collect();

        let max_flush = self.config.effective_max_flush();
        let packets_in = Arc::new(AtomicU64::new(0));
        let packets_out = Arc::new(AtomicU64::new(0));

        let mut handle_iter = handles.into_iter();
        let mut threads: Vec<JoinHandle<Result<()>>> = Vec::with_capacity(stages);

        // Input stage.
        threads.push(spawn_stage(
            input.name(),
            input_thread(
                input,
                handle_iter.next().expect("one handle per stage"),
                Arc::clone(&queues[0]),
                Arc::clone(&shared),
                self.config.effective_max_input(),
                StuffingInjector::new(self.config.stuffing),
                Arc::clone(&packets_in),
            ),
        )?);

        // Processor stages.
        for (i, proc) in processors.into_iter().enumerate() {
            threads.push(spawn_stage(
                proc.name(),
                processor_thread(
                    proc,
                    handle_iter.next().expect("one handle per stage"),
                    Arc::clone(&queues[i]),
                    Arc::clone(&queues[i + 1]),
                    Arc::clone(&shared),
                    max_flush,
                ),
            )?);
        }

        // Output stage.
        threads.push(spawn_stage(
            output.name(),
            output_thread(
                output,
                handle_iter.next().expect("one handle per stage"),
                Arc::clone(&queues[boundaries - 1]),
                max_flush,
                Arc::clone(&packets_out),
            ),
        )?);

        let monitor_token = CancellationToken::new();
        let monitor_thread = if self.config.monitor {
            Some(monitor::spawn(
                monitor_token.clone(),
                queues.clone(),
                self.config.monitor_interval,
            )?)
        } else {
            None
        };

        // Join everything; the first stage error wins.
        let mut first_error = None;
        for thread in threads {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(PipelineError::Processing(
                            "stage thread panicked".to_string(),
                        ));
                    }
                }
            }
        }
        monitor_token.cancel();
        if let Some(thread) = monitor_thread {
            let _ = thread.join();
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                let summary = PipelineSummary {
                    packets_in: packets_in.load(Ordering::Relaxed),
                    packets_out: packets_out.load(Ordering::Relaxed),
                };
                info!(
                    packets_in = summary.packets_in,
                    packets_out = summary.packets_out,
                    "pipeline terminated"
                );
                Ok(summary)
            }
        }
    }

    fn start_stages(
        input: &mut Box<dyn PacketInput>,
        processors: &mut [Box<dyn PacketProcessor>],
        output: &mut Box<dyn PacketOutput>,
        handles: &[StageHandle],
    ) -> Result<()> {
        let fail = |stage: &'static str, source: PipelineError| PipelineError::StageStart {
            stage,
            source: Box::new(source),
        };

        if let Err(err) = input.start(&handles[0]) {
            return Err(fail(input.name(), err));
        }
        for i in 0..processors.len() {
            let name = processors[i].name();
            if let Err(err) = processors[i].start(&handles[i + 1]) {
                // Wind down the stages that did start.
                input.stop(&handles[0]);
                for j in 0..i {
                    processors[j].stop(&handles[j + 1]);
                }
                return Err(fail(name, err));
            }
        }
        if let Err(err) = output.start(&handles[handles.len() - 1]) {
            input.stop(&handles[0]);
            for (j, started) in processors.iter_mut().enumerate() {
                started.stop(&handles[j + 1]);
            }
            return Err(fail(output.name(), err));
        }
        Ok(())
    }
}

fn spawn_stage(
    name: &'static str,
    body: impl FnOnce() -> Result<()> + Send + 'static,
) -> Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name(format!("tsp-{name}"))
        .spawn(body)
        .map_err(PipelineError::Io)
}

fn input_thread(
    mut input: Box<dyn PacketInput>,
    handle: StageHandle,
    out_q: Arc<PacketQueue>,
    shared: Arc<PipelineShared>,
    max_input: usize,
    mut injector: StuffingInjector,
    packets_in: Arc<AtomicU64>,
) -> impl FnOnce() -> Result<()> + Send + 'static {
    move || {
        let mut buf = vec![NULL_PACKET; max_input.clamp(1, 65_536)];
        let mut batch: Vec<TsPacket> = Vec::with_capacity(buf.len() + 16);
        let mut interrupted = false;

        while !handle.is_cancelled() {
            let count = match input.receive(&handle, &mut buf) {
                Ok(0) => {
                    debug!(stage = handle.stage_name(), "end of input");
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    // Input errors degrade to end-of-input.
                    error!(stage = handle.stage_name(), %err, "input error");
                    break;
                }
            };
            shared.bitrate.report_input(input.bitrate());
            batch.clear();
            injector.apply(&buf[..count], &mut batch);
            for pkt in &batch {
                shared.bitrate.feed(pkt);
            }
            packets_in.fetch_add(batch.len() as u64, Ordering::Relaxed);
            if !out_q.push(&mut batch) {
                interrupted = true;
                break;
            }
        }

        if !interrupted {
            let mut tail = injector.trailing();
            if !tail.is_empty() {
                packets_in.fetch_add(tail.len() as u64, Ordering::Relaxed);
                out_q.push(&mut tail);
            }
        }
        input.stop(&handle);
        out_q.set_eof();
        Ok(())
    }
}

fn processor_thread(
    mut proc: Box<dyn PacketProcessor>,
    handle: StageHandle,
    in_q: Arc<PacketQueue>,
    out_q: Arc<PacketQueue>,
    shared: Arc<PipelineShared>,
    max_flush: usize,
) -> impl FnOnce() -> Result<()> + Send + 'static {
    move || {
        let mut batch: Vec<TsPacket> = Vec::with_capacity(max_flush);
        let mut out: Vec<TsPacket> = Vec::with_capacity(max_flush);
        let result = loop {
            batch.clear();
            if !in_q.pop(&mut batch, max_flush) {
                // Upstream flow is over; release anything held back.
                out_q.push(&mut out);
                break Ok(());
            }
            let mut terminate = false;
            let mut failed = None;
            for mut pkt in batch.drain(..) {
                let mut feedback = PacketFeedback::default();
                match proc.process(&handle, &mut pkt, &mut feedback) {
                    Ok(PacketStatus::Ok) => out.push(pkt),
                    Ok(PacketStatus::Null) => {
                        pkt.make_null();
                        out.push(pkt);
                    }
                    Ok(PacketStatus::Drop) => {}
                    Ok(PacketStatus::End) => {
                        info!(stage = handle.stage_name(), "stage requested termination");
                        terminate = true;
                        break;
                    }
                    Err(err) => {
                        error!(stage = handle.stage_name(), %err, "stage failed");
                        failed = Some(err);
                        break;
                    }
                }
                if feedback.bitrate_changed {
                    shared.bitrate.refresh();
                }
                if feedback.flush && !out.is_empty() && !out_q.push(&mut out) {
                    terminate = true;
                    break;
                }
            }
            if let Some(err) = failed {
                shared.token.cancel();
                in_q.stop();
                out_q.push(&mut out);
                break Err(PipelineError::in_stage(handle.stage_name(), err));
            }
            if terminate {
                shared.token.cancel();
                in_q.stop();
                out_q.push(&mut out);
                break Ok(());
            }
            if !out.is_empty() && !out_q.push(&mut out) {
                // Downstream went away; stop the flow upstream.
                in_q.stop();
                break Ok(());
            }
        };
        proc.stop(&handle);
        out_q.set_eof();
        result
    }
}

fn output_thread(
    mut output: Box<dyn PacketOutput>,
    handle: StageHandle,
    in_q: Arc<PacketQueue>,
    max_flush: usize,
    packets_out: Arc<AtomicU64>,
) -> impl FnOnce() -> Result<()> + Send + 'static {
    move || {
        let mut batch: Vec<TsPacket> = Vec::with_capacity(max_flush);
        let result = loop {
            batch.clear();
            if !in_q.pop(&mut batch, max_flush) {
                break Ok(());
            }
            if let Err(err) = output.send(&handle, &batch) {
                error!(stage = handle.stage_name(), %err, "output failed");
                handle.shared().token.cancel();
                in_q.stop();
                break Err(PipelineError::in_stage(handle.stage_name(), err));
            }
            packets_out.fetch_add(batch.len() as u64, Ordering::Relaxed);
        };
        output.stop(&handle);
        result
    }
}
