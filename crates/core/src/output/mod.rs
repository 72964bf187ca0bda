//! Output sinks: where composited group ranges end up.
//!
//! A sink receives one [`RangeFrame`] per group per frame and a final
//! [`OutputSink::render`]. Saturation, brightness and color correction are
//! applied by the sink (or by the controller the sink forwards to), never by
//! the compositor.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use crate::color::{clamp, fract, rainbow_hue_to_rgb8, ColorMode};
use crate::settings::{GroupSettings, RenderMode};

/// Port remote controllers listen on when the target names none.
pub const DEFAULT_UDP_PORT: u16 = 8888;

/// How long a target that failed to resolve is skipped before the next
/// lookup.
pub const RESOLVE_RETRY: Duration = Duration::from_secs(5);

const PACKET_START: u8 = 0x00;
const HEADER_LEN: usize = 13;

/// Controller command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Calibration = 0,
    RenderRgb = 1,
    RenderHsv = 2,
    WriteLeds = 3,
}

/// Destination of a group's pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct OutputRoute {
    pub mode: RenderMode,
    pub target: String,
}

impl OutputRoute {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn udp(target: impl Into<String>) -> Self {
        Self {
            mode: RenderMode::Udp,
            target: target.into(),
        }
    }

    pub fn of(group: &GroupSettings) -> Self {
        Self {
            mode: group.render_mode,
            target: group.render_target.clone(),
        }
    }
}

/// One group's evaluated pixels for the current frame.
#[derive(Debug, Clone, Copy)]
pub struct RangeFrame<'a> {
    /// `end - start` raw triples in `mode`'s color space.
    pub pixels: &'a [[f64; 3]],
    pub start: usize,
    pub end: usize,
    pub correction: [f64; 3],
    pub saturation: f64,
    pub brightness: f64,
    pub mode: ColorMode,
    pub route: &'a OutputRoute,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot resolve output target `{0}`")]
    Resolve(String),
    #[error("output `{route}`: {source}")]
    Io {
        route: String,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} output has no target")]
    MissingTarget(RenderMode),
    #[error("range {start}..{end} does not fit in a controller packet")]
    RangeTooLarge { start: usize, end: usize },
}

/// Receives composited ranges and pushes complete frames to hardware.
pub trait OutputSink: Send {
    fn set_range(&mut self, frame: &RangeFrame<'_>) -> Result<(), TransportError>;

    /// Latches everything set since the previous call.
    fn render(&mut self) -> Result<(), TransportError>;

    /// Shows the correction color at `brightness` on the whole strip behind
    /// `route`.
    fn calibrate(
        &mut self,
        route: &OutputRoute,
        correction: [f64; 3],
        brightness: f64,
    ) -> Result<(), TransportError>;

    /// Writes black to `0..led_count` on every route and renders.
    ///
    /// Every route is tried; the first failure is returned at the end.
    fn clear(&mut self, led_count: usize, routes: &[OutputRoute]) -> Result<(), TransportError> {
        let black = vec![[0.0; 3]; led_count];
        let mut first_error = None;
        for route in routes {
            let cleared = self.set_range(&RangeFrame {
                pixels: &black,
                start: 0,
                end: led_count,
                correction: [1.0; 3],
                saturation: 1.0,
                brightness: 0.0,
                mode: ColorMode::Rgb,
                route,
            });
            if let Err(err) = cleared {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.render() {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// `a * b / 256`, the controller's 8-bit fixed point multiply.
pub fn scale_8(a: u8, b: u8) -> u8 {
    ((u16::from(a) * u16::from(b)) >> 8) as u8
}

/// Maps a unit value to a byte, clamping out-of-range input.
pub fn unit_to_byte(value: f64) -> u8 {
    if value.is_nan() {
        0
    } else {
        (clamp(value, 0.0, 1.0) * 255.0) as u8
    }
}

/// Raw pattern triple as sent on the wire. Hue wraps, everything else clamps.
pub fn encode_pixel(color: [f64; 3], mode: ColorMode) -> [u8; 3] {
    match mode {
        ColorMode::Hsv => [
            (fract(color[0]) * 255.0) as u8,
            unit_to_byte(color[1]),
            unit_to_byte(color[2]),
        ],
        ColorMode::Rgb => color.map(unit_to_byte),
    }
}

/// HSV bytes to output RGB using the rainbow hue map.
///
/// Value is squared for perceptual dimming before brightness applies.
pub fn render_hsv8(hsv: [u8; 3], correction: [u8; 3], saturation: u8, brightness: u8) -> [u8; 3] {
    let sat = scale_8(hsv[1], saturation);
    let mut val = scale_8(hsv[2], hsv[2]);
    if val > 0 && val < 255 {
        val += 1;
    }
    let val = scale_8(val, brightness);

    let mut rgb = rainbow_hue_to_rgb8(hsv[0]);
    if sat != 255 {
        if sat == 0 {
            rgb = [255; 3];
        } else {
            let desat = scale_8(255 - sat, 255 - sat);
            rgb = rgb.map(|c| scale_8(c, sat).saturating_add(desat));
        }
    }
    if val != 255 {
        rgb = if val == 0 {
            [0; 3]
        } else {
            rgb.map(|c| scale_8(c, val))
        };
    }
    [0, 1, 2].map(|i| scale_8(rgb[i], correction[i]))
}

/// RGB bytes to output RGB. Desaturation pulls channels toward their mean.
pub fn render_rgb8(rgb: [u8; 3], correction: [u8; 3], saturation: u8, brightness: u8) -> [u8; 3] {
    let mut channels = rgb.map(i32::from);
    if saturation != 255 {
        let mean = channels.iter().sum::<i32>() / 3;
        channels = if saturation == 0 {
            [mean; 3]
        } else {
            channels.map(|c| (c - mean) * i32::from(saturation) / 256 + mean)
        };
    }
    [0, 1, 2].map(|i| {
        let c = channels[i].clamp(0, 255) as u32;
        ((c * u32::from(brightness) * u32::from(correction[i])) >> 16) as u8
    })
}

/// The correction color at `brightness`, shown on every LED in calibration.
pub fn render_calibration8(correction: [u8; 3], brightness: u8) -> [u8; 3] {
    correction.map(|c| scale_8(c, brightness))
}

/// Controller packet carrying one range of raw pixels.
pub fn encode_range_packet(frame: &RangeFrame<'_>) -> Result<Vec<u8>, TransportError> {
    let too_large = || TransportError::RangeTooLarge {
        start: frame.start,
        end: frame.end,
    };
    let count = frame.end.saturating_sub(frame.start).min(frame.pixels.len());
    let total = HEADER_LEN + count * 3;
    let len = u16::try_from(total).map_err(|_| too_large())?;
    let start = u16::try_from(frame.start).map_err(|_| too_large())?;
    let end = u16::try_from(frame.start + count).map_err(|_| too_large())?;

    let command = match frame.mode {
        ColorMode::Rgb => Command::RenderRgb,
        ColorMode::Hsv => Command::RenderHsv,
    };
    let correction = frame.correction.map(unit_to_byte);
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&[PACKET_START, command as u8]);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(&correction);
    packet.push(unit_to_byte(frame.saturation));
    packet.push(unit_to_byte(frame.brightness));
    packet.extend_from_slice(&start.to_be_bytes());
    packet.extend_from_slice(&end.to_be_bytes());
    for color in &frame.pixels[..count] {
        packet.extend_from_slice(&encode_pixel(*color, frame.mode));
    }
    Ok(packet)
}

/// Packet that fills a controller's whole strip with its correction color.
pub fn encode_calibration_packet(correction: [f64; 3], brightness: f64) -> [u8; 8] {
    let [r, g, b] = correction.map(unit_to_byte);
    [
        PACKET_START,
        Command::Calibration as u8,
        0,
        8,
        r,
        g,
        b,
        unit_to_byte(brightness),
    ]
}

/// Packet that makes a controller show what it has received.
pub fn encode_write_packet() -> [u8; 4] {
    [PACKET_START, Command::WriteLeds as u8, 0, 4]
}

/// Frame buffer of the locally attached strip.
///
/// Keeps the last raw input and its color mode per LED next to the 8-bit
/// output, so previews and tests can inspect both.
#[derive(Debug, Clone)]
pub struct LocalFrameBuffer {
    input: Vec<[f64; 3]>,
    modes: Vec<ColorMode>,
    output: Vec<[u8; 3]>,
    frames: u64,
}

impl LocalFrameBuffer {
    pub fn new(led_count: usize) -> Self {
        Self {
            input: vec![[0.0; 3]; led_count],
            modes: vec![ColorMode::Hsv; led_count],
            output: vec![[0; 3]; led_count],
            frames: 0,
        }
    }

    pub fn led_count(&self) -> usize {
        self.output.len()
    }

    pub fn input(&self) -> &[[f64; 3]] {
        &self.input
    }

    pub fn modes(&self) -> &[ColorMode] {
        &self.modes
    }

    pub fn output(&self) -> &[[u8; 3]] {
        &self.output
    }

    /// Number of completed [`OutputSink::render`] calls.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn write(&mut self, frame: &RangeFrame<'_>) {
        let end = frame.end.min(self.output.len());
        if frame.start >= end {
            return;
        }
        let correction = frame.correction.map(unit_to_byte);
        let saturation = unit_to_byte(frame.saturation);
        let brightness = unit_to_byte(frame.brightness);
        for (i, color) in (frame.start..end).zip(frame.pixels) {
            let bytes = encode_pixel(*color, frame.mode);
            self.input[i] = *color;
            self.modes[i] = frame.mode;
            self.output[i] = match frame.mode {
                ColorMode::Hsv => render_hsv8(bytes, correction, saturation, brightness),
                ColorMode::Rgb => render_rgb8(bytes, correction, saturation, brightness),
            };
        }
    }
}

impl OutputSink for LocalFrameBuffer {
    fn set_range(&mut self, frame: &RangeFrame<'_>) -> Result<(), TransportError> {
        self.write(frame);
        Ok(())
    }

    fn calibrate(
        &mut self,
        _route: &OutputRoute,
        correction: [f64; 3],
        brightness: f64,
    ) -> Result<(), TransportError> {
        let color = render_calibration8(correction.map(unit_to_byte), unit_to_byte(brightness));
        self.input.fill([1.0; 3]);
        self.modes.fill(ColorMode::Rgb);
        self.output.fill(color);
        Ok(())
    }

    fn render(&mut self) -> Result<(), TransportError> {
        self.frames += 1;
        Ok(())
    }
}

/// Sends each range where its group's route points.
///
/// Local routes land in an inner [`LocalFrameBuffer`]; serial and UDP routes
/// receive controller packets. Remote handles are opened lazily and dropped
/// after a failure so the next frame retries. Host names that fail to
/// resolve are not looked up again for [`RESOLVE_RETRY`].
#[derive(Debug)]
pub struct RoutedSink {
    local: LocalFrameBuffer,
    socket: Option<UdpSocket>,
    resolved: HashMap<String, SocketAddr>,
    unresolved: HashMap<String, Instant>,
    serial: HashMap<String, File>,
    touched: Vec<OutputRoute>,
}

impl RoutedSink {
    pub fn new(led_count: usize) -> Self {
        Self {
            local: LocalFrameBuffer::new(led_count),
            socket: None,
            resolved: HashMap::new(),
            unresolved: HashMap::new(),
            serial: HashMap::new(),
            touched: Vec::new(),
        }
    }

    pub fn local(&self) -> &LocalFrameBuffer {
        &self.local
    }

    fn send(&mut self, route: &OutputRoute, packet: &[u8]) -> Result<(), TransportError> {
        if route.target.is_empty() {
            return Err(TransportError::MissingTarget(route.mode));
        }
        match route.mode {
            RenderMode::Local => Ok(()),
            RenderMode::Udp => self.send_udp(&route.target, packet),
            RenderMode::Serial => self.send_serial(&route.target, packet),
        }
    }

    fn send_udp(&mut self, target: &str, packet: &[u8]) -> Result<(), TransportError> {
        let io_error = |source| TransportError::Io {
            route: target.to_string(),
            source,
        };
        let addr = self.resolve(target)?;
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0").map_err(io_error)?;
            socket.set_nonblocking(true).map_err(io_error)?;
            self.socket = Some(socket);
        }
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        match socket.send_to(packet, addr) {
            Ok(_) => Ok(()),
            // a full send buffer drops the packet; the next frame replaces it
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!(target, "udp send would block, packet dropped");
                Ok(())
            }
            Err(err) => {
                self.socket = None;
                self.resolved.remove(target);
                Err(io_error(err))
            }
        }
    }

    fn resolve(&mut self, target: &str) -> Result<SocketAddr, TransportError> {
        if let Some(addr) = self.resolved.get(target) {
            return Ok(*addr);
        }
        if let Some(failed_at) = self.unresolved.get(target) {
            if failed_at.elapsed() < RESOLVE_RETRY {
                return Err(TransportError::Resolve(target.to_string()));
            }
        }
        match resolve_udp_target(target) {
            Ok(addr) => {
                self.unresolved.remove(target);
                self.resolved.insert(target.to_string(), addr);
                Ok(addr)
            }
            Err(err) => {
                tracing::warn!(target, retry_secs = RESOLVE_RETRY.as_secs(), "cannot resolve udp target");
                self.unresolved.insert(target.to_string(), Instant::now());
                Err(err)
            }
        }
    }

    fn send_serial(&mut self, target: &str, packet: &[u8]) -> Result<(), TransportError> {
        let io_error = |source| TransportError::Io {
            route: target.to_string(),
            source,
        };
        if !self.serial.contains_key(target) {
            let device = OpenOptions::new()
                .write(true)
                .open(target)
                .map_err(io_error)?;
            tracing::info!(target, "opened serial output");
            self.serial.insert(target.to_string(), device);
        }
        let Some(device) = self.serial.get_mut(target) else {
            return Ok(());
        };
        if let Err(err) = device.write_all(packet).and_then(|()| device.flush()) {
            self.serial.remove(target);
            return Err(io_error(err));
        }
        Ok(())
    }
}

impl OutputSink for RoutedSink {
    fn set_range(&mut self, frame: &RangeFrame<'_>) -> Result<(), TransportError> {
        if frame.route.mode == RenderMode::Local {
            return self.local.set_range(frame);
        }
        if !self.touched.contains(frame.route) {
            self.touched.push(frame.route.clone());
        }
        let packet = encode_range_packet(frame)?;
        self.send(frame.route, &packet)
    }

    /// Remote controllers latch calibration packets on their own, so the
    /// route is not flushed by [`OutputSink::render`].
    fn calibrate(
        &mut self,
        route: &OutputRoute,
        correction: [f64; 3],
        brightness: f64,
    ) -> Result<(), TransportError> {
        if route.mode == RenderMode::Local {
            return self.local.calibrate(route, correction, brightness);
        }
        self.send(route, &encode_calibration_packet(correction, brightness))
    }

    /// Flushes every remote route written this frame; the first failure is
    /// returned after all routes were tried.
    fn render(&mut self) -> Result<(), TransportError> {
        let mut first_error = None;
        let write = encode_write_packet();
        for route in std::mem::take(&mut self.touched) {
            if let Err(err) = self.send(&route, &write) {
                first_error.get_or_insert(err);
            }
        }
        self.local.render()?;
        first_error.map_or(Ok(()), Err)
    }
}

/// `host` or `host:port`; the port defaults to [`DEFAULT_UDP_PORT`].
pub fn resolve_udp_target(target: &str) -> Result<SocketAddr, TransportError> {
    let resolve = |spec: &str| spec.to_socket_addrs().ok().and_then(|mut addrs| addrs.next());
    resolve(target)
        .or_else(|| resolve(&format!("{target}:{DEFAULT_UDP_PORT}")))
        .ok_or_else(|| TransportError::Resolve(target.to_string()))
}
