//! The cpal backend: default playback and capture on desktop hosts.
//!
//! `cpal::Stream` is not `Send`, so each backend instance runs a small
//! control thread that owns the stream and services start/stop commands
//! over a channel. The output callback mixes straight into the stream
//! buffer through a thread-local scratch buffer; the input callback pushes
//! captured samples into a lock-free ring read by `capture_samples`.

use super::{Backend, BackendFactory, BackendKind};
use crate::device::DeviceInner;
use crate::error::{AuricleError, Result};
use crate::format::{ChannelLayout, DeviceFormat, SampleType};
use crate::mixer::MixOut;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::cell::RefCell;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

// Scratch for sample-format conversion in the output callback.
thread_local! {
    static MIX_SCRATCH: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct CpalFactory;

impl BackendFactory for CpalFactory {
    fn init(&self) -> bool {
        // A host always exists; whether devices do is probed later.
        true
    }

    fn supports(&self, _kind: BackendKind) -> bool {
        true
    }

    fn probe(&self, kind: BackendKind) -> Vec<String> {
        let host = cpal::default_host();
        let devices = match kind {
            BackendKind::Playback => host.output_devices().map(|d| d.collect::<Vec<_>>()),
            BackendKind::Capture => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        };
        match devices {
            Ok(devs) => devs.iter().filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    fn create(&self, device: Weak<DeviceInner>, kind: BackendKind) -> Option<Box<dyn Backend>> {
        match kind {
            BackendKind::Playback => Some(Box::new(CpalPlayback {
                device,
                os_name: None,
                default_config: None,
                supported_rates: Vec::new(),
                fmt: DeviceFormat::default(),
                control: None,
            })),
            BackendKind::Capture => Some(Box::new(CpalCapture {
                device,
                os_name: None,
                frequency: crate::format::DEFAULT_OUTPUT_RATE,
                channels: 1,
                capacity: 0,
                consumer: None,
                control: None,
            })),
        }
    }
}

fn find_device(kind: BackendKind, name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => match kind {
            BackendKind::Playback => host.default_output_device(),
            BackendKind::Capture => host.default_input_device(),
        }
        .ok_or_else(|| AuricleError::Backend("no default audio device".into())),
        Some(wanted) => {
            let mut devices = match kind {
                BackendKind::Playback => host
                    .output_devices()
                    .map_err(|e| AuricleError::Backend(e.to_string()))?,
                BackendKind::Capture => host
                    .input_devices()
                    .map_err(|e| AuricleError::Backend(e.to_string()))?,
            };
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| AuricleError::Backend(format!("no device named \"{}\"", wanted)))
        }
    }
}

fn layout_from_count(count: u16) -> ChannelLayout {
    match count {
        1 => ChannelLayout::Mono,
        4 => ChannelLayout::Quad,
        6 => ChannelLayout::X51,
        7 => ChannelLayout::X61,
        8 => ChannelLayout::X71,
        _ => ChannelLayout::Stereo,
    }
}

enum StreamCmd {
    Start {
        params: StreamParams,
        reply: Sender<bool>,
    },
    Stop {
        reply: Sender<()>,
    },
    Quit,
}

struct StreamParams {
    kind: BackendKind,
    os_name: Option<String>,
    device: Weak<DeviceInner>,
    frequency: u32,
    channels: u16,
    buffer_frames: Option<u32>,
    sample_type: SampleType,
    producer: Option<HeapProd<f32>>,
}

struct Control {
    cmd: Sender<StreamCmd>,
    thread: Option<JoinHandle<()>>,
}

impl Control {
    fn spawn() -> Control {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("auricle-stream".into())
            .spawn(move || stream_thread(rx))
            .expect("failed to spawn stream control thread");
        Control {
            cmd: tx,
            thread: Some(thread),
        }
    }

    fn start(&self, params: StreamParams) -> bool {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self
            .cmd
            .send(StreamCmd::Start {
                params,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }
        reply_rx.recv().unwrap_or(false)
    }

    fn stop(&self) {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self.cmd.send(StreamCmd::Stop { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv();
        }
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        let _ = self.cmd.send(StreamCmd::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn stream_thread(rx: Receiver<StreamCmd>) {
    // The stream lives on this thread for its whole life.
    let mut stream: Option<cpal::Stream> = None;
    while let Ok(cmd) = rx.recv() {
        match cmd {
            StreamCmd::Start { params, reply } => {
                stream = None;
                let built = build_stream(params);
                let ok = built.is_ok();
                match built {
                    Ok(s) => stream = Some(s),
                    Err(e) => error!("Failed to start stream: {}", e),
                }
                let _ = reply.send(ok);
            }
            StreamCmd::Stop { reply } => {
                stream = None;
                let _ = reply.send(());
            }
            StreamCmd::Quit => break,
        }
    }
}

fn build_stream(params: StreamParams) -> Result<cpal::Stream> {
    let device = find_device(params.kind, params.os_name.as_deref())?;
    let config = cpal::StreamConfig {
        channels: params.channels,
        sample_rate: cpal::SampleRate(params.frequency),
        buffer_size: match params.buffer_frames {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        },
    };

    let stream = match params.kind {
        BackendKind::Playback => {
            let weak = params.device.clone();
            match params.sample_type {
                SampleType::I16 => build_output::<i16>(&device, &config, weak)?,
                SampleType::U16 => build_output::<u16>(&device, &config, weak)?,
                _ => build_output::<f32>(&device, &config, weak)?,
            }
        }
        BackendKind::Capture => {
            let producer = params
                .producer
                .ok_or_else(|| AuricleError::Backend("capture stream without ring".into()))?;
            let supported = device
                .default_input_config()
                .map_err(|e| AuricleError::Backend(e.to_string()))?;
            match supported.sample_format() {
                cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, producer)?,
                cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, producer)?,
                _ => build_input::<f32>(&device, &config, producer)?,
            }
        }
    };

    stream
        .play()
        .map_err(|e| AuricleError::Backend(format!("failed to start stream: {}", e)))?;
    Ok(stream)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    weak: Weak<DeviceInner>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let err_weak = weak.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let Some(dev) = weak.upgrade() else {
                    fill_silence(data);
                    return;
                };
                // A caller holding the state lock is reconfiguring the
                // device; emit silence instead of waiting on it.
                let Ok(mut state) = dev.state.try_lock() else {
                    fill_silence(data);
                    return;
                };
                let channels = state.mix.real_channel_count().max(1);
                let frames = data.len() / channels;
                MIX_SCRATCH.with(|buf| {
                    let mut scratch = buf.borrow_mut();
                    scratch.resize(data.len(), 0.0);
                    crate::mixer::mix_data(&dev, &mut state, MixOut::F32(&mut scratch[..]), frames);
                    drop(state);
                    for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample(s);
                    }
                });
            },
            move |err| {
                error!("Output stream error: {}", err);
                if let Some(dev) = err_weak.upgrade() {
                    dev.disconnect(&format!("Output stream failure: {}", err));
                }
            },
            None,
        )
        .map_err(|e| AuricleError::Backend(format!("failed to build stream: {}", e)))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<f32>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut dropped = 0usize;
                for &sample in data {
                    if producer.try_push(f32::from_sample(sample)).is_err() {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    warn!("Capture overrun, dropped {} samples", dropped);
                }
            },
            |err| error!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| AuricleError::Backend(format!("failed to build stream: {}", e)))
}

fn fill_silence<T>(data: &mut [T])
where
    T: SizedSample + FromSample<f32>,
{
    for sample in data.iter_mut() {
        *sample = T::from_sample(0.0f32);
    }
}

struct CpalPlayback {
    device: Weak<DeviceInner>,
    os_name: Option<String>,
    default_config: Option<cpal::SupportedStreamConfig>,
    supported_rates: Vec<(u32, u32)>,
    fmt: DeviceFormat,
    control: Option<Control>,
}

impl Backend for CpalPlayback {
    fn open(&mut self, name: Option<&str>) -> Result<String> {
        let device = find_device(BackendKind::Playback, name)?;
        let resolved = device.name().unwrap_or_else(|_| "Default Output".into());
        let default_config = device
            .default_output_config()
            .map_err(|e| AuricleError::Backend(format!("failed to query device config: {}", e)))?;

        self.supported_rates = device
            .supported_output_configs()
            .map(|configs| {
                configs
                    .map(|c| (c.min_sample_rate().0, c.max_sample_rate().0))
                    .collect()
            })
            .unwrap_or_default();

        info!(
            "Opened \"{}\": {} ch, {} Hz, {:?}",
            resolved,
            default_config.channels(),
            default_config.sample_rate().0,
            default_config.sample_format()
        );
        self.os_name = name.map(str::to_owned);
        self.default_config = Some(default_config);
        Ok(resolved)
    }

    fn reset(&mut self, fmt: &mut DeviceFormat) -> bool {
        let Some(config) = &self.default_config else {
            return false;
        };

        let device_channels = config.channels();
        if !(fmt.requests.channels && fmt.channel_count() == device_channels as usize) {
            fmt.channels = layout_from_count(device_channels);
            fmt.ambi_order = 0;
        }

        let rate_supported = |rate: u32| {
            self.supported_rates
                .iter()
                .any(|&(min, max)| (min..=max).contains(&rate))
        };
        if !(fmt.requests.frequency && rate_supported(fmt.frequency)) {
            fmt.frequency = config.sample_rate().0;
        }

        let device_type = match config.sample_format() {
            cpal::SampleFormat::I16 => SampleType::I16,
            cpal::SampleFormat::U16 => SampleType::U16,
            _ => SampleType::F32,
        };
        if !(fmt.requests.sample_type && fmt.sample_type == device_type) {
            fmt.sample_type = device_type;
        }

        // Keep the tick size inside the device's supported buffer range.
        if let cpal::SupportedBufferSize::Range { min, max } = config.buffer_size() {
            fmt.update_size = fmt.update_size.clamp(*min, *max);
        }

        self.fmt = fmt.clone();
        true
    }

    fn start(&mut self) -> bool {
        let buffer_frames = match self.default_config.as_ref().map(|c| c.buffer_size()) {
            Some(cpal::SupportedBufferSize::Range { .. }) => Some(self.fmt.update_size),
            _ => None,
        };
        let params = StreamParams {
            kind: BackendKind::Playback,
            os_name: self.os_name.clone(),
            device: self.device.clone(),
            frequency: self.fmt.frequency,
            channels: self.fmt.channel_count() as u16,
            buffer_frames,
            sample_type: self.fmt.sample_type,
            producer: None,
        };
        self.control.get_or_insert_with(Control::spawn).start(params)
    }

    fn stop(&mut self) {
        if let Some(control) = &self.control {
            control.stop();
        }
    }
}

struct CpalCapture {
    device: Weak<DeviceInner>,
    os_name: Option<String>,
    frequency: u32,
    channels: u16,
    capacity: usize,
    consumer: Option<Arc<Mutex<HeapCons<f32>>>>,
    control: Option<Control>,
}

impl Backend for CpalCapture {
    fn open(&mut self, name: Option<&str>) -> Result<String> {
        let device = find_device(BackendKind::Capture, name)?;
        let resolved = device.name().unwrap_or_else(|_| "Default Input".into());
        self.os_name = name.map(str::to_owned);
        debug!(
            "Capture \"{}\": {} ch, {} Hz, ring of {} frames",
            resolved,
            self.channels,
            self.frequency,
            self.capacity / self.channels.max(1) as usize,
        );
        Ok(resolved)
    }

    /// The caller fixed the capture format before open; cache the ring
    /// shape here, between backend creation and the stream start.
    fn reset(&mut self, fmt: &mut DeviceFormat) -> bool {
        self.frequency = fmt.frequency;
        self.channels = fmt.channel_count() as u16;
        let buffer_frames = (fmt.update_size * fmt.num_updates.max(1)) as usize;
        self.capacity = buffer_frames.max(1) * self.channels as usize;
        true
    }

    fn start(&mut self) -> bool {
        let ring = HeapRb::<f32>::new(self.capacity.max(1));
        let (producer, consumer) = ring.split();
        self.consumer = Some(Arc::new(Mutex::new(consumer)));

        let params = StreamParams {
            kind: BackendKind::Capture,
            os_name: self.os_name.clone(),
            device: self.device.clone(),
            frequency: self.frequency,
            channels: self.channels,
            buffer_frames: None,
            sample_type: SampleType::F32,
            producer: Some(producer),
        };
        self.control.get_or_insert_with(Control::spawn).start(params)
    }

    fn stop(&mut self) {
        if let Some(control) = &self.control {
            control.stop();
        }
    }

    fn available_samples(&mut self) -> usize {
        let Some(consumer) = &self.consumer else {
            return 0;
        };
        let consumer = consumer.lock().unwrap_or_else(|e| e.into_inner());
        consumer.occupied_len() / self.channels as usize
    }

    fn capture_samples(&mut self, out: &mut [f32]) -> Result<()> {
        let Some(consumer) = &self.consumer else {
            return Err(AuricleError::InvalidValue("capture not started".into()));
        };
        let mut consumer = consumer.lock().unwrap_or_else(|e| e.into_inner());
        if consumer.occupied_len() < out.len() {
            return Err(AuricleError::InvalidValue(
                "more samples requested than captured".into(),
            ));
        }
        let popped = consumer.pop_slice(out);
        debug_assert_eq!(popped, out.len());
        Ok(())
    }
}
