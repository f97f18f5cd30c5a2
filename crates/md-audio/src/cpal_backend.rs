//! CPAL-based audio output backend.
//!
//! `cpal::Stream` cannot leave the thread that built it on every host, so
//! each open stream lives on its own device thread and is driven through a
//! command channel.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use md_pcm::{OutputFormat, RenderBlock};

use crate::error::{AudioError, AudioResult};
use crate::traits::{AudioBackend, ErrorCallback, OutputDevice, RenderCallback, StreamRequest};

/// Opens streams on the default output device of the default host.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

enum DeviceCommand {
    Start(Sender<AudioResult<()>>),
    Stop(Sender<AudioResult<()>>),
    Close,
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> AudioResult<Box<dyn OutputDevice>> {
        let request = *request;
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("md-cpal-{}", request.sample_rate))
            .spawn(move || match build_stream(&request, render, on_error) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    run_device(stream, command_rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::DeviceInit(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::debug!(
                    "opened cpal stream: {} Hz, {} ch, {:?}",
                    request.sample_rate,
                    request.channels,
                    request.format
                );
                Ok(Box::new(CpalDevice {
                    request,
                    commands: command_tx,
                    thread: Some(thread),
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::DeviceThread)
            }
        }
    }
}

fn build_stream(
    request: &StreamRequest,
    mut render: RenderCallback,
    on_error: ErrorCallback,
) -> AudioResult<Stream> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

    let config = StreamConfig {
        channels: request.channels,
        sample_rate: SampleRate(request.sample_rate),
        buffer_size: BufferSize::Default,
    };
    let channels = request.channels;
    let error_callback = move |err: cpal::StreamError| on_error(AudioError::Stream(err.to_string()));

    let stream = match request.format {
        OutputFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                render(&mut RenderBlock::i16(data, channels));
            },
            error_callback,
            None,
        ),
        OutputFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render(&mut RenderBlock::f32(data, channels));
            },
            error_callback,
            None,
        ),
    }
    .map_err(|e| AudioError::StreamCreate(e.to_string()))?;

    // Some hosts start streams on creation.
    stream.pause().map_err(|e| AudioError::Playback(e.to_string()))?;
    Ok(stream)
}

fn run_device(stream: Stream, commands: Receiver<DeviceCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::Start(reply) => {
                let _ = reply.send(stream.play().map_err(|e| AudioError::Playback(e.to_string())));
            }
            DeviceCommand::Stop(reply) => {
                let _ = reply.send(stream.pause().map_err(|e| AudioError::Playback(e.to_string())));
            }
            DeviceCommand::Close => break,
        }
    }
}

struct CpalDevice {
    request: StreamRequest,
    commands: Sender<DeviceCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    fn send(&self, make: impl FnOnce(Sender<AudioResult<()>>) -> DeviceCommand) -> AudioResult<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AudioError::DeviceThread)?;
        reply_rx.recv().map_err(|_| AudioError::DeviceThread)?
    }
}

impl OutputDevice for CpalDevice {
    fn request(&self) -> StreamRequest {
        self.request
    }

    fn start(&mut self) -> AudioResult<()> {
        self.send(DeviceCommand::Start)
    }

    fn stop(&mut self) -> AudioResult<()> {
        self.send(DeviceCommand::Stop)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("cpal device thread panicked ({} Hz)", self.request.sample_rate);
            }
        }
    }
}
