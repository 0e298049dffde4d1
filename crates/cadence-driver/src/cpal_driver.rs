//! Hardware audio driver backed by cpal.
//!
//! As master, the output stream's callback is the clock: each callback runs one
//! engine cycle and then interleaves the `system:playback_N` ports into the
//! device buffer. An input stream, when capture channels are requested, writes
//! into `system:capture_N`.
//!
//! Supports ALSA (Linux), CoreAudio (macOS), and WASAPI (Windows) through cpal's
//! default host.

use crate::driver::{Driver, DriverContext, DriverCore, DriverSettings};
use crate::dummy::SYSTEM_CLIENT;
use crate::{DriverError, Result};
use cadence_core::{MAX_BUFFER_SIZE, ParamDescriptor, ParamValue, PortId, ResolvedParams};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

/// Parameters accepted by the cpal driver.
pub fn cpal_params() -> Vec<ParamDescriptor> {
    vec![
        ParamDescriptor::new(
            "device",
            'd',
            ParamValue::Str(String::new()),
            "Device name filter (empty = system default)",
        ),
        ParamDescriptor::new("rate", 'r', ParamValue::UInt(48000), "Sample rate"),
        ParamDescriptor::new("period", 'p', ParamValue::UInt(1024), "Frames per period"),
        ParamDescriptor::new("capture", 'C', ParamValue::UInt(0), "Number of capture channels"),
        ParamDescriptor::new("playback", 'P', ParamValue::UInt(2), "Number of playback channels"),
    ]
}

fn device_name(device: &cpal::Device) -> std::result::Result<String, cpal::DeviceNameError> {
    device.description().map(|d| d.name().to_string())
}

/// Names of the output devices on the default host.
pub fn output_device_names() -> Vec<String> {
    cpal::default_host()
        .output_devices()
        .map(|devices| devices.filter_map(|d| device_name(&d).ok()).collect())
        .unwrap_or_default()
}

fn find_device(filter: &str, output: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if filter.is_empty() {
        let device = if output {
            host.default_output_device()
        } else {
            host.default_input_device()
        };
        return device.ok_or_else(|| DriverError::Backend("no default audio device".to_string()));
    }
    let search = filter.to_lowercase();
    let devices = if output {
        host.output_devices()
    } else {
        host.input_devices()
    }
    .map_err(|e| DriverError::Backend(e.to_string()))?;
    for device in devices {
        if let Ok(name) = device_name(&device)
            && name.to_lowercase().contains(&search)
        {
            return Ok(device);
        }
    }
    Err(DriverError::Backend(format!(
        "no {} device matching '{filter}'",
        if output { "output" } else { "input" }
    )))
}

/// Keeps a cpal stream alive; dropping it stops the stream.
struct StreamHandle {
    _inner: Box<dyn Send>,
}

impl StreamHandle {
    fn new<T: Send + 'static>(stream: T) -> Self {
        Self {
            _inner: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

/// Audio driver for a cpal device.
#[derive(Debug)]
pub struct CpalDriver {
    core: DriverCore,
    device: String,
    streams: Mutex<Vec<StreamHandle>>,
}

impl CpalDriver {
    /// Builds and opens a cpal driver from resolved parameters.
    ///
    /// Fails if no matching device exists.
    pub fn from_params(ctx: &DriverContext, params: &ResolvedParams) -> Result<Self> {
        let device = params.str("device").unwrap_or_default().to_string();
        let settings = DriverSettings {
            buffer_size: params.uint32("period").unwrap_or(1024),
            sample_rate: params.uint32("rate").unwrap_or(48000),
            capture_channels: params.uint32("capture").unwrap_or(0),
            playback_channels: params.uint32("playback").unwrap_or(2),
        };
        if settings.playback_channels == 0 {
            return Err(DriverError::Backend(
                "cpal driver needs at least one playback channel".to_string(),
            ));
        }
        let output = find_device(&device, true)?;
        tracing::info!(
            device = device_name(&output).unwrap_or_default(),
            "cpal output device selected"
        );
        if settings.capture_channels > 0 {
            find_device(&device, false)?;
        }
        let driver = Self {
            core: DriverCore::new(SYSTEM_CLIENT, ctx, true),
            device,
            streams: Mutex::new(Vec::new()),
        };
        driver.open(settings)?;
        Ok(driver)
    }

    fn stream_config(&self, channels: usize) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: channels as u16,
            sample_rate: self.core.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(self.core.buffer_size()),
        }
    }

    fn build_output(&self) -> Result<StreamHandle> {
        let device = find_device(&self.device, true)?;
        let playback: Vec<PortId> = self.core.playback_ports();
        let channels = playback.len().max(1);
        let config = self.stream_config(channels);
        let core = self.core.clone();
        let mut scratch = vec![0.0f32; MAX_BUFFER_SIZE as usize];

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    core.run_cycle();
                    let graph = core.engine().graph();
                    let frames = (data.len() / channels).min(scratch.len());
                    let buf = &mut scratch[..frames];
                    for (ch, port) in playback.iter().enumerate() {
                        if !graph.try_mix_input(*port, buf) {
                            buf.fill(0.0);
                        }
                        for (i, sample) in buf.iter().enumerate() {
                            data[i * channels + ch] = *sample;
                        }
                    }
                },
                move |err| {
                    tracing::warn!(error = %err, "cpal output stream error");
                },
                None,
            )
            .map_err(|e| DriverError::Backend(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DriverError::Backend(e.to_string()))?;
        tracing::info!(
            channels,
            sample_rate = config.sample_rate,
            buffer_size = self.core.buffer_size(),
            "output stream started"
        );
        Ok(StreamHandle::new(stream))
    }

    fn build_input(&self) -> Result<StreamHandle> {
        let device = find_device(&self.device, false)?;
        let capture: Vec<PortId> = self.core.capture_ports();
        let channels = capture.len().max(1);
        let config = self.stream_config(channels);
        let core = self.core.clone();
        let mut scratch = vec![0.0f32; MAX_BUFFER_SIZE as usize];

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let graph = core.engine().graph();
                    let frames = (data.len() / channels).min(scratch.len());
                    let buf = &mut scratch[..frames];
                    for (ch, port) in capture.iter().enumerate() {
                        for (i, sample) in buf.iter_mut().enumerate() {
                            *sample = data[i * channels + ch];
                        }
                        graph.try_write_buffer(*port, buf);
                    }
                },
                move |err| {
                    tracing::warn!(error = %err, "cpal input stream error");
                },
                None,
            )
            .map_err(|e| DriverError::Backend(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DriverError::Backend(e.to_string()))?;
        tracing::info!(channels, "input stream started");
        Ok(StreamHandle::new(stream))
    }
}

impl Driver for CpalDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn start(&self) -> Result<()> {
        self.core.start()?;
        if !self.core.is_master() {
            return Ok(());
        }
        let mut streams = Vec::new();
        let built = (|| -> Result<()> {
            if !self.core.capture_ports().is_empty() {
                streams.push(self.build_input()?);
            }
            streams.push(self.build_output()?);
            Ok(())
        })();
        if let Err(err) = built {
            self.core.stop();
            return Err(err);
        }
        *self.streams.lock() = streams;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let streams = std::mem::take(&mut *self.streams.lock());
        if !streams.is_empty() {
            tracing::info!("cpal streams stopped");
        }
        drop(streams);
        self.core.stop();
        Ok(())
    }
}
