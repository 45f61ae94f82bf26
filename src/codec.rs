use crate::frame::LedFrame;
use crate::types::{Rgb, MAX_STROBE_HZ};
use byteorder::{BigEndian, ByteOrder};

/// Wire format for the LED characteristic.
///
/// Frame payload (no command byte):
///
/// | Offset | Size | Field                                   |
/// |--------|------|-----------------------------------------|
/// | 2·i    | 2    | LED i, RGB565 big-endian, physical order |
///
/// RGB565 word: `R>>3` in bits 15–11, `G>>2` in bits 10–5, `B>>3` in bits 4–0.
/// The shifts drop the low bits of every channel, so encoding is lossy by
/// up to 7 (red/blue) or 3 (green) per channel.
///
/// Control commands share the characteristic and are told apart by length
/// (a frame is always at least 4 bytes):
///
/// | Command    | Bytes | Layout                                  |
/// |------------|-------|-----------------------------------------|
/// | brightness | 2     | `CMD_BRIGHTNESS`, value 0–255           |
/// | strobe     | 3     | `CMD_STROBE`, Hz×10 as u16 big-endian   |
pub const CMD_BRIGHTNESS: u8 = 0x42;
pub const CMD_STROBE: u8 = 0x53;

pub const BRIGHTNESS_COMMAND_LEN: usize = 2;
pub const STROBE_COMMAND_LEN: usize = 3;

/// Anything that can be read as a sequence of RGB triplets.
///
/// The live loop hands over flat byte buffers; UI controls produce nested
/// `[R, G, B]` lists. Both encode to identical bytes.
pub trait ColorSource {
    fn led_count(&self) -> usize;
    fn rgb(&self, index: usize) -> Rgb;
}

impl ColorSource for [u8] {
    fn led_count(&self) -> usize {
        assert!(
            self.len() % 3 == 0,
            "flat RGB buffer length {} is not a multiple of 3",
            self.len()
        );
        self.len() / 3
    }

    fn rgb(&self, index: usize) -> Rgb {
        let i = index * 3;
        [self[i], self[i + 1], self[i + 2]]
    }
}

impl ColorSource for [Rgb] {
    fn led_count(&self) -> usize {
        self.len()
    }

    fn rgb(&self, index: usize) -> Rgb {
        self[index]
    }
}

impl ColorSource for Vec<u8> {
    fn led_count(&self) -> usize {
        self.as_slice().led_count()
    }

    fn rgb(&self, index: usize) -> Rgb {
        self.as_slice().rgb(index)
    }
}

impl ColorSource for Vec<Rgb> {
    fn led_count(&self) -> usize {
        self.len()
    }

    fn rgb(&self, index: usize) -> Rgb {
        self[index]
    }
}

impl ColorSource for LedFrame {
    fn led_count(&self) -> usize {
        LedFrame::led_count(self)
    }

    fn rgb(&self, index: usize) -> Rgb {
        self.pixel(index)
    }
}

/// Pack one color into an RGB565 word.
pub fn rgb565(color: Rgb) -> u16 {
    let [r, g, b] = color;
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// Expand an RGB565 word back to 8-bit channels (low bits zero).
pub fn rgb565_to_rgb(word: u16) -> Rgb {
    let r = ((word >> 11) & 0x1F) as u8;
    let g = ((word >> 5) & 0x3F) as u8;
    let b = (word & 0x1F) as u8;
    [r << 3, g << 2, b << 3]
}

/// Encode colors into a new payload of `2 * led_count` bytes.
pub fn encode_frame<C: ColorSource + ?Sized>(colors: &C) -> Vec<u8> {
    let mut out = Vec::new();
    encode_frame_into(colors, &mut out);
    out
}

/// Encode into a reusable buffer (resized to fit).
pub fn encode_frame_into<C: ColorSource + ?Sized>(colors: &C, out: &mut Vec<u8>) {
    let n = colors.led_count();
    out.resize(n * 2, 0);
    for i in 0..n {
        BigEndian::write_u16(&mut out[i * 2..i * 2 + 2], rgb565(colors.rgb(i)));
    }
}

/// Decode a frame payload into nested colors.
pub fn decode_frame(payload: &[u8]) -> Result<Vec<Rgb>, String> {
    if payload.len() % 2 != 0 {
        return Err(format!("odd payload length: {}", payload.len()));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|w| rgb565_to_rgb(BigEndian::read_u16(w)))
        .collect())
}

/// `[CMD_STROBE, hz*10 (u16 BE)]`. Hz is clamped to 0–100; 0 means solid on.
pub fn encode_strobe(hz: f32) -> [u8; STROBE_COMMAND_LEN] {
    let hz = if hz.is_finite() { hz.clamp(0.0, MAX_STROBE_HZ) } else { 0.0 };
    let tenths = (hz * 10.0).round() as u16;
    let mut buf = [CMD_STROBE, 0, 0];
    BigEndian::write_u16(&mut buf[1..], tenths);
    buf
}

pub fn decode_strobe(cmd: &[u8]) -> Result<f32, String> {
    if cmd.len() != STROBE_COMMAND_LEN {
        return Err(format!("wrong size: {}", cmd.len()));
    }
    if cmd[0] != CMD_STROBE {
        return Err(format!("bad command: 0x{:02X}", cmd[0]));
    }
    Ok(BigEndian::read_u16(&cmd[1..]) as f32 / 10.0)
}

/// `[CMD_BRIGHTNESS, value]` for the device-side calibration setting.
pub fn encode_brightness(value: u8) -> [u8; BRIGHTNESS_COMMAND_LEN] {
    [CMD_BRIGHTNESS, value]
}
