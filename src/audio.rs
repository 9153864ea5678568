//! Device audio for the WebRTC backend: microphone capture encoded into a
//! local PCMU track, and playback of remote PCMU tracks.
//!
//! `cpal` streams are not `Send`, so each one lives on its own thread and
//! exchanges samples with the async side through channels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::media::Sample as MediaSample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub const SAMPLE_RATE: u32 = 8000;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const FRAME_SAMPLES: usize = 160;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;
pub const ULAW_SILENCE: u8 = 0xFF;

const CAPTURE_BACKLOG: usize = 64;
// one second at 8 kHz
const MAX_PLAYBACK_BUFFER: usize = SAMPLE_RATE as usize;

/// G.711 µ-law encode.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// G.711 µ-law decode.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn to_pcm(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Mixes interleaved device frames down to mono and keeps every n-th one
/// to reach 8 kHz.
struct Decimator {
    channels: usize,
    step: f64,
    phase: f64,
}

impl Decimator {
    fn new(device_rate: u32, channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
            step: (device_rate as f64 / SAMPLE_RATE as f64).max(1.0),
            phase: 0.0,
        }
    }

    fn push(&mut self, interleaved: &[f32], out: &mut Vec<i16>) {
        for frame in interleaved.chunks(self.channels) {
            self.phase -= 1.0;
            if self.phase < 0.0 {
                let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                out.push(to_pcm(mono));
                self.phase += self.step;
            }
        }
    }
}

/// Holds each 8 kHz sample for as many device frames as it covers.
struct Playhead {
    step: f32,
    phase: f32,
    current: f32,
}

impl Playhead {
    fn new(device_rate: u32) -> Self {
        Self {
            step: SAMPLE_RATE as f32 / device_rate.max(1) as f32,
            phase: 1.0,
            current: 0.0,
        }
    }

    /// Plays silence on underrun.
    fn next(&mut self, queue: &mut VecDeque<i16>) -> f32 {
        while self.phase >= 1.0 {
            self.phase -= 1.0;
            self.current = queue
                .pop_front()
                .map_or(0.0, |s| s as f32 / -(i16::MIN as f32));
        }
        self.phase += self.step;
        self.current
    }
}

/// Runs the stream built by `open` on a dedicated thread until the returned
/// sender fires or is dropped.
async fn run_on_device_thread<T, F>(name: &str, open: F) -> Result<(oneshot::Sender<()>, T)>
where
    T: Send + 'static,
    F: FnOnce() -> Result<(cpal::Stream, T)> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || match open() {
            Ok((stream, info)) => {
                let _ = ready_tx.send(Ok(info));
                let _ = stop_rx.blocking_recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })?;

    let info = ready_rx
        .await
        .map_err(|_| anyhow!("{} thread exited before the stream started", name))??;
    Ok((stop_tx, info))
}

pub struct AudioCapture {
    stop: Option<oneshot::Sender<()>>,
    encoder: JoinHandle<()>,
}

impl AudioCapture {
    /// Opens the default input device and feeds `track` with 20 ms PCMU
    /// frames. While `enabled` is false the frames carry silence.
    pub async fn start(track: Arc<TrackLocalStaticSample>, enabled: Arc<AtomicBool>) -> Result<Self> {
        let (sample_tx, sample_rx) = mpsc::channel(CAPTURE_BACKLOG);
        let (stop, (rate, channels)) =
            run_on_device_thread("audio-capture", move || open_input(sample_tx)).await?;
        debug!(rate, channels, "capture started");

        let encoder = tokio::spawn(encode_loop(track, enabled, sample_rx, Decimator::new(rate, channels)));
        Ok(Self {
            stop: Some(stop),
            encoder,
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            self.encoder.abort();
            debug!("capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(samples: mpsc::Sender<Vec<f32>>) -> Result<(cpal::Stream, (u32, u16))> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No input device available"))?;

    let config = device.default_input_config()?;
    debug!(?config, "input config");
    let stream_config = config.config();

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, samples)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, samples)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, samples)?,
        sample_format => bail!("Unsupported sample format: {:?}", sample_format),
    };
    stream.play()?;

    Ok((stream, (stream_config.sample_rate.0, stream_config.channels)))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| warn!("input stream error: {}", err);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let chunk: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
            if samples.try_send(chunk).is_err() {
                trace!("capture backlog full, dropping chunk");
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

async fn encode_loop(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    mut samples: mpsc::Receiver<Vec<f32>>,
    mut decimator: Decimator,
) {
    let mut pending = Vec::with_capacity(FRAME_SAMPLES * 2);
    while let Some(chunk) = samples.recv().await {
        decimator.push(&chunk, &mut pending);
        while pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = pending.drain(..FRAME_SAMPLES).collect();
            let payload: Vec<u8> = if enabled.load(Ordering::Relaxed) {
                frame.iter().map(|&s| linear_to_ulaw(s)).collect()
            } else {
                vec![ULAW_SILENCE; FRAME_SAMPLES]
            };
            let sample = MediaSample {
                data: Bytes::from(payload),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                trace!("failed to write audio sample: {}", e);
            }
        }
    }
    debug!("capture encoder finished");
}

/// Plays one remote track on the default output device until dropped.
pub struct AudioPlayback {
    stop: Option<oneshot::Sender<()>>,
    decoder: JoinHandle<()>,
}

impl AudioPlayback {
    pub async fn start(track: Arc<TrackRemote>) -> Result<Self> {
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_PLAYBACK_BUFFER)));

        let output = Arc::clone(&buffer);
        let (stop, ()) = run_on_device_thread("audio-playback", move || {
            open_output(output).map(|stream| (stream, ()))
        })
        .await?;

        let ssrc = track.ssrc();
        let decoder = tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        let mut queue = match buffer.lock() {
                            Ok(queue) => queue,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        queue.extend(packet.payload.iter().map(|&b| ulaw_to_linear(b)));
                        let excess = queue.len().saturating_sub(MAX_PLAYBACK_BUFFER);
                        queue.drain(..excess);
                    }
                    Err(e) => {
                        debug!(ssrc, "remote track ended: {}", e);
                        break;
                    }
                }
            }
        });

        debug!(ssrc, "playback started");
        Ok(Self {
            stop: Some(stop),
            decoder,
        })
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.decoder.abort();
    }
}

fn open_output(buffer: Arc<Mutex<VecDeque<i16>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No output device available"))?;

    let config = device.default_output_config()?;
    debug!(?config, "output config");
    let stream_config = config.config();

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &stream_config, buffer)?,
        SampleFormat::I16 => build_output_stream::<i16>(&device, &stream_config, buffer)?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &stream_config, buffer)?,
        sample_format => bail!("Unsupported sample format: {:?}", sample_format),
    };
    stream.play()?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffer: Arc<Mutex<VecDeque<i16>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut playhead = Playhead::new(config.sample_rate.0);
    let err_fn = |err| warn!("output stream error: {}", err);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = match buffer.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(playhead.next(&mut queue));
                for out in frame.iter_mut() {
                    *out = value;
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
