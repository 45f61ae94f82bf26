pub mod analyser;
pub mod beat;
pub mod ble;
pub mod codec;
pub mod config;
pub mod console_display;
pub mod dsp;
pub mod frame;
pub mod pattern;
pub mod pattern_file;
pub mod player;
pub mod preview;
pub mod serial_bridge;
pub mod simulator;
pub mod stream;
pub mod strobe;
pub mod types;
pub mod ws_server;
