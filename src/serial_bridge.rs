use crate::ble::{
    BleError, CharacteristicHandle, DeviceInfo, DisconnectReason, GattTransport,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Packet framing between the host and a USB BLE bridge dongle:
///
/// | Offset | Size | Field                    |
/// |--------|------|--------------------------|
/// | 0      | 2    | sync (0xBEEF, LE)        |
/// | 2      | 1    | kind                     |
/// | 3      | 1    | sequence                 |
/// | 4      | 2    | payload length (u16 LE)  |
/// | 6      | n    | payload                  |
/// | 6+n    | 2    | CRC16 over bytes 0..6+n  |
///
/// Requests carry a sequence number that the dongle echoes in its reply.
/// Writes are fire-and-forget and get no reply. `DISCONNECTED` is the only
/// unsolicited packet.
const SYNC_WORD: u16 = 0xBEEF;
const HEADER_SIZE: usize = 6;
const OVERHEAD: usize = HEADER_SIZE + 2;
pub const MAX_PAYLOAD: usize = 2048;
pub const DEFAULT_BAUD: u32 = 921_600;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub mod kind {
    pub const SCAN: u8 = 0x01;
    pub const CONNECT: u8 = 0x02;
    pub const DISCOVER: u8 = 0x03;
    pub const WRITE: u8 = 0x04;
    pub const DISCONNECT: u8 = 0x05;

    pub const DEVICE: u8 = 0x81;
    pub const CONNECTED: u8 = 0x82;
    pub const HANDLE: u8 = 0x83;
    pub const ERROR: u8 = 0x8E;
    pub const DISCONNECTED: u8 = 0x8F;
}

/// Error codes carried in an `ERROR` reply.
pub mod error_code {
    pub const CANCELLED: u8 = 1;
    pub const NOT_FOUND: u8 = 2;
    pub const CONNECT_FAILED: u8 = 3;
    pub const NO_SERVICE: u8 = 4;
    pub const NO_CHARACTERISTIC: u8 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u8,
    pub seq: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: u8, seq: u8, payload: Vec<u8>) -> Self {
        Self { kind, seq, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OVERHEAD + self.payload.len());
        // Writes into a Vec cannot fail
        let _ = buf.write_u16::<LittleEndian>(SYNC_WORD);
        buf.push(self.kind);
        buf.push(self.seq);
        let _ = buf.write_u16::<LittleEndian>(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        let crc = crc16(&buf);
        let _ = buf.write_u16::<LittleEndian>(crc);
        buf
    }
}

fn find_sync(buf: &[u8]) -> Option<usize> {
    (0..buf.len().saturating_sub(1)).find(|&i| buf[i] == 0xEF && buf[i + 1] == 0xBE)
}

/// Parse one complete packet. `data` must be exactly one packet long.
fn parse_packet(data: &[u8]) -> Result<Packet, String> {
    if data.len() < OVERHEAD {
        return Err(format!("wrong size: {}", data.len()));
    }
    let mut cursor = Cursor::new(data);
    let sync = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| e.to_string())?;
    if sync != SYNC_WORD {
        return Err(format!("bad sync: 0x{:04X}", sync));
    }
    let kind = cursor.read_u8().map_err(|e| e.to_string())?;
    let seq = cursor.read_u8().map_err(|e| e.to_string())?;
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| e.to_string())? as usize;
    if data.len() != OVERHEAD + len {
        return Err(format!("wrong size: {} for payload {}", data.len(), len));
    }
    let body_end = HEADER_SIZE + len;
    let received_crc = u16::from_le_bytes([data[body_end], data[body_end + 1]]);
    let computed_crc = crc16(&data[..body_end]);
    if received_crc != computed_crc {
        return Err(format!(
            "CRC mismatch: received 0x{:04X}, computed 0x{:04X}",
            received_crc, computed_crc
        ));
    }
    Ok(Packet {
        kind,
        seq,
        payload: data[HEADER_SIZE..body_end].to_vec(),
    })
}

/// CRC-16/CCITT-FALSE
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Reassembles packets from an arbitrary byte stream, resyncing on garbage.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: Vec<u8>,
    errors: u64,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.buf.len() >= OVERHEAD {
            let Some(sync_pos) = find_sync(&self.buf) else {
                // Keep a trailing 0xEF that may start the next sync word
                let keep = self.buf.len().saturating_sub(1);
                self.buf.drain(..keep);
                break;
            };
            if sync_pos > 0 {
                debug!("bridge: skipping {} bytes to sync", sync_pos);
                self.buf.drain(..sync_pos);
            }
            if self.buf.len() < HEADER_SIZE {
                break;
            }
            let len = u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
            if len > MAX_PAYLOAD {
                self.errors += 1;
                debug!("bridge: oversized length {}, resyncing", len);
                self.buf.drain(..2);
                continue;
            }
            if self.buf.len() < OVERHEAD + len {
                break;
            }
            let frame: Vec<u8> = self.buf.drain(..OVERHEAD + len).collect();
            match parse_packet(&frame) {
                Ok(p) => out.push(p),
                Err(e) => {
                    self.errors += 1;
                    debug!("bridge: packet parse error: {}", e);
                }
            }
        }
        out
    }
}

type EventSlot = Arc<Mutex<Option<Sender<DisconnectReason>>>>;

fn notify(events: &EventSlot, reason: DisconnectReason) {
    let slot = events.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(tx) = slot.as_ref() {
        let _ = tx.try_send(reason);
    }
}

fn reader_loop<R: Read>(mut reader: R, replies: Sender<Packet>, events: EventSlot) {
    let mut buf = [0u8; 256];
    let mut decoder = PacketDecoder::new();
    let mut packet_count: u64 = 0;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("bridge: serial stream closed");
                notify(&events, DisconnectReason::LinkLost("bridge closed".to_string()));
                return;
            }
            Ok(n) => {
                for packet in decoder.push(&buf[..n]) {
                    packet_count += 1;
                    if packet_count.is_multiple_of(5000) {
                        info!(
                            "bridge: {} packets, {} errors",
                            packet_count,
                            decoder.errors()
                        );
                    }
                    if packet.kind == kind::DISCONNECTED {
                        let reason = if packet.payload.is_empty() {
                            DisconnectReason::PeripheralClosed
                        } else {
                            DisconnectReason::LinkLost(
                                String::from_utf8_lossy(&packet.payload).into_owned(),
                            )
                        };
                        notify(&events, reason);
                    } else if replies.send(packet).is_err() {
                        return;
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("bridge: serial read error: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// `GattTransport` over a serial link to a BLE bridge dongle.
pub struct SerialBridge<W: Write + Send> {
    writer: W,
    replies: Receiver<Packet>,
    events: EventSlot,
    seq: u8,
    timeout: Duration,
}

impl<W: Write + Send> SerialBridge<W> {
    /// Start the reader thread on `reader` and send requests on `writer`.
    pub fn new<R: Read + Send + 'static>(reader: R, writer: W) -> io::Result<Self> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(64);
        let events: EventSlot = Arc::new(Mutex::new(None));
        let ev = Arc::clone(&events);
        std::thread::Builder::new()
            .name("bridge-rx".into())
            .spawn(move || reader_loop(reader, reply_tx, ev))?;
        Ok(Self {
            writer,
            replies: reply_rx,
            events,
            seq: 0,
            timeout: REPLY_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn send(&mut self, kind: u8, payload: Vec<u8>) -> Result<u8, BleError> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let bytes = Packet::new(kind, seq, payload).encode();
        self.writer
            .write_all(&bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| BleError::Transport(e.to_string()))?;
        Ok(seq)
    }

    /// Send a request and wait for the reply with the same sequence number.
    fn request(&mut self, kind: u8, payload: Vec<u8>) -> Result<Packet, BleError> {
        let seq = self.send(kind, payload)?;
        loop {
            match self.replies.recv_timeout(self.timeout) {
                Ok(p) if p.seq == seq => return Ok(p),
                Ok(p) => debug!("bridge: dropping stale reply seq {} (want {})", p.seq, seq),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BleError::Transport(format!(
                        "no reply to 0x{:02X} within {:?}",
                        kind, self.timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BleError::Transport("bridge reader stopped".to_string()))
                }
            }
        }
    }
}

fn reply_error(p: &Packet, service: Uuid, characteristic: Uuid) -> BleError {
    let msg = String::from_utf8_lossy(p.payload.get(1..).unwrap_or(&[])).into_owned();
    match p.payload.first().copied() {
        Some(error_code::CANCELLED) => BleError::ChooserCancelled,
        Some(error_code::NOT_FOUND) => BleError::DeviceNotFound,
        Some(error_code::CONNECT_FAILED) => BleError::GattConnect(msg),
        Some(error_code::NO_SERVICE) => BleError::ServiceNotFound(service),
        Some(error_code::NO_CHARACTERISTIC) => BleError::CharacteristicNotFound(characteristic),
        _ => BleError::Transport(format!("bridge error: {}", msg)),
    }
}

fn unexpected(p: &Packet) -> BleError {
    BleError::Transport(format!("unexpected reply kind 0x{:02X}", p.kind))
}

impl<W: Write + Send> GattTransport for SerialBridge<W> {
    fn request_device(
        &mut self,
        service: Uuid,
        name_prefix: Option<&str>,
    ) -> Result<DeviceInfo, BleError> {
        let mut payload = service.as_bytes().to_vec();
        payload.extend_from_slice(name_prefix.unwrap_or("").as_bytes());
        let p = self.request(kind::SCAN, payload)?;
        match p.kind {
            kind::DEVICE => {
                // [id_len u8][id][name]
                let id_len = *p.payload.first().ok_or_else(|| unexpected(&p))? as usize;
                let id = p.payload.get(1..1 + id_len).ok_or_else(|| unexpected(&p))?;
                let name = &p.payload[1 + id_len..];
                Ok(DeviceInfo {
                    id: String::from_utf8_lossy(id).into_owned(),
                    name: String::from_utf8_lossy(name).into_owned(),
                })
            }
            kind::ERROR => Err(reply_error(&p, service, Uuid::nil())),
            _ => Err(unexpected(&p)),
        }
    }

    fn connect_gatt(&mut self, device: &DeviceInfo) -> Result<Receiver<DisconnectReason>, BleError> {
        let p = self.request(kind::CONNECT, device.id.as_bytes().to_vec())?;
        match p.kind {
            kind::CONNECTED => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
                Ok(rx)
            }
            kind::ERROR => Err(reply_error(&p, Uuid::nil(), Uuid::nil())),
            _ => Err(unexpected(&p)),
        }
    }

    fn characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, BleError> {
        let mut payload = service.as_bytes().to_vec();
        payload.extend_from_slice(characteristic.as_bytes());
        let p = self.request(kind::DISCOVER, payload)?;
        match p.kind {
            kind::HANDLE => {
                let mut c = Cursor::new(&p.payload);
                let handle = c
                    .read_u16::<LittleEndian>()
                    .map_err(|e| BleError::Transport(e.to_string()))?;
                Ok(CharacteristicHandle(handle))
            }
            kind::ERROR => Err(reply_error(&p, service, characteristic)),
            _ => Err(unexpected(&p)),
        }
    }

    fn write_without_response(
        &mut self,
        handle: CharacteristicHandle,
        data: &[u8],
    ) -> Result<(), BleError> {
        if data.len() + 2 > MAX_PAYLOAD {
            return Err(BleError::Write(format!("{} bytes exceeds bridge MTU", data.len())));
        }
        let mut payload = Vec::with_capacity(2 + data.len());
        let _ = payload.write_u16::<LittleEndian>(handle.0);
        payload.extend_from_slice(data);
        self.send(kind::WRITE, payload)
            .map(|_| ())
            .map_err(|e| BleError::Write(e.to_string()))
    }

    fn disconnect(&mut self) {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Err(e) = self.send(kind::DISCONNECT, Vec::new()) {
            debug!("bridge: disconnect request not sent: {}", e);
        }
    }
}

/// Open a bridge dongle on a serial port.
#[cfg(feature = "hardware")]
pub fn open_port(
    port_name: &str,
    baud_rate: u32,
) -> Result<SerialBridge<Box<dyn serialport::SerialPort>>, BleError> {
    info!("Opening BLE bridge: {} @ {}", port_name, baud_rate);
    let port = serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| BleError::Transport(format!("{}: {}", port_name, e)))?;
    let reader = port
        .try_clone()
        .map_err(|e| BleError::Transport(e.to_string()))?;
    SerialBridge::new(reader, port).map_err(|e| BleError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{LED_CHARACTERISTIC_UUID, LED_SERVICE_UUID};

    /// Blocking reader fed through a channel; EOF when the sender drops.
    struct ChannelReader {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(bytes) => self.pending = bytes,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn bridge() -> (SerialBridge<SharedWriter>, Sender<Vec<u8>>, SharedWriter) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let out = SharedWriter::default();
        let reader = ChannelReader { rx, pending: Vec::new() };
        let b = SerialBridge::new(reader, out.clone())
            .unwrap()
            .with_timeout(Duration::from_millis(500));
        (b, tx, out)
    }

    fn sent(out: &SharedWriter) -> Vec<Packet> {
        PacketDecoder::new().push(&out.0.lock().unwrap())
    }

    fn device_reply(seq: u8) -> Vec<u8> {
        let mut payload = vec![6];
        payload.extend_from_slice(b"AA:BB1ChromaMind LED");
        Packet::new(kind::DEVICE, seq, payload).encode()
    }

    #[test]
    fn test_crc16() {
        assert_eq!(crc16(b"123456789"), 0x29B1, "CRC-16/CCITT-FALSE of '123456789'");
    }

    #[test]
    fn test_find_sync() {
        assert_eq!(find_sync(&[0x00, 0x00, 0xEF, 0xBE, 0x01]), Some(2));
        assert_eq!(find_sync(&[0xEF, 0xBE]), Some(0));
        assert_eq!(find_sync(&[0x00, 0x01, 0xEF]), None);
        assert_eq!(find_sync(&[]), None);
    }

    #[test]
    fn test_packet_layout() {
        let bytes = Packet::new(kind::WRITE, 7, vec![0x2A, 0x00, 0x53]).encode();
        assert_eq!(&bytes[..6], &[0xEF, 0xBE, 0x04, 0x07, 0x03, 0x00]);
        assert_eq!(bytes.len(), 3 + OVERHEAD);
        let crc = crc16(&bytes[..9]);
        assert_eq!(&bytes[9..], &crc.to_le_bytes());
    }

    #[test]
    fn test_parse_bad_crc() {
        let mut bytes = Packet::new(kind::HANDLE, 1, vec![1, 0]).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = parse_packet(&bytes).unwrap_err();
        assert!(err.contains("CRC mismatch"));
    }

    #[test]
    fn test_decoder_resyncs_and_splits() {
        let a = Packet::new(kind::CONNECTED, 1, vec![]);
        let b = Packet::new(kind::HANDLE, 2, vec![0x2A, 0x00]);
        let mut stream = vec![0x11, 0x22, 0xEF];
        stream.extend(a.encode());
        stream.extend(b.encode());

        let mut d = PacketDecoder::new();
        // Feed in awkward chunks
        let mut got = d.push(&stream[..5]);
        got.extend(d.push(&stream[5..13]));
        got.extend(d.push(&stream[13..]));
        assert_eq!(got, vec![a, b]);
    }

    #[test]
    fn test_decoder_counts_corrupt_packets() {
        let mut bad = Packet::new(kind::CONNECTED, 1, vec![9]).encode();
        bad[6] ^= 0x01;
        let good = Packet::new(kind::CONNECTED, 2, vec![]);
        let mut d = PacketDecoder::new();
        let mut stream = bad;
        stream.extend(good.encode());
        assert_eq!(d.push(&stream), vec![good]);
        assert_eq!(d.errors(), 1);
    }

    #[test]
    fn test_connect_sequence() {
        let (mut b, tx, out) = bridge();
        tx.send(device_reply(0)).unwrap();
        tx.send(Packet::new(kind::CONNECTED, 1, vec![]).encode()).unwrap();
        tx.send(Packet::new(kind::HANDLE, 2, vec![0x2A, 0x00]).encode()).unwrap();

        let dev = b.request_device(LED_SERVICE_UUID, Some("Chroma")).unwrap();
        assert_eq!(dev.id, "AA:BB1");
        assert_eq!(dev.name, "ChromaMind LED");
        let _events = b.connect_gatt(&dev).unwrap();
        let h = b
            .characteristic(LED_SERVICE_UUID, LED_CHARACTERISTIC_UUID)
            .unwrap();
        assert_eq!(h, CharacteristicHandle(0x2A));

        let reqs = sent(&out);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].kind, kind::SCAN);
        assert_eq!(&reqs[0].payload[..16], LED_SERVICE_UUID.as_bytes());
        assert_eq!(&reqs[0].payload[16..], b"Chroma");
        assert_eq!(reqs[1].payload, b"AA:BB1");
        assert_eq!(&reqs[2].payload[16..], LED_CHARACTERISTIC_UUID.as_bytes());
    }

    #[test]
    fn test_write_is_fire_and_forget() {
        let (mut b, _tx, out) = bridge();
        b.write_without_response(CharacteristicHandle(0x2A), &[0x53, 0x00, 0x78])
            .unwrap();
        let reqs = sent(&out);
        assert_eq!(reqs[0].kind, kind::WRITE);
        assert_eq!(reqs[0].payload, vec![0x2A, 0x00, 0x53, 0x00, 0x78]);
    }

    #[test]
    fn test_error_reply_mapping() {
        let (mut b, tx, _out) = bridge();
        tx.send(Packet::new(kind::ERROR, 0, vec![error_code::CANCELLED]).encode())
            .unwrap();
        assert_eq!(
            b.request_device(LED_SERVICE_UUID, None),
            Err(BleError::ChooserCancelled)
        );
        let mut payload = vec![error_code::CONNECT_FAILED];
        payload.extend_from_slice(b"timeout");
        tx.send(Packet::new(kind::ERROR, 1, payload).encode()).unwrap();
        let dev = DeviceInfo {
            id: "x".into(),
            name: "y".into(),
        };
        assert_eq!(
            b.connect_gatt(&dev).err(),
            Some(BleError::GattConnect("timeout".into()))
        );
    }

    #[test]
    fn test_stale_reply_skipped() {
        let (mut b, tx, _out) = bridge();
        tx.send(Packet::new(kind::CONNECTED, 9, vec![]).encode()).unwrap();
        tx.send(device_reply(0)).unwrap();
        assert!(b.request_device(LED_SERVICE_UUID, None).is_ok());
    }

    #[test]
    fn test_reply_timeout() {
        let (b, _tx, _out) = bridge();
        let mut b = b.with_timeout(Duration::from_millis(20));
        match b.request_device(LED_SERVICE_UUID, None) {
            Err(BleError::Transport(msg)) => assert!(msg.contains("no reply")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_unsolicited_disconnect() {
        let (mut b, tx, _out) = bridge();
        tx.send(Packet::new(kind::CONNECTED, 0, vec![]).encode()).unwrap();
        let dev = DeviceInfo {
            id: "x".into(),
            name: "y".into(),
        };
        let events = b.connect_gatt(&dev).unwrap();
        tx.send(Packet::new(kind::DISCONNECTED, 0, vec![]).encode()).unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)),
            Ok(DisconnectReason::PeripheralClosed)
        );
    }

    #[test]
    fn test_stream_close_reports_link_lost() {
        let (mut b, tx, _out) = bridge();
        tx.send(Packet::new(kind::CONNECTED, 0, vec![]).encode()).unwrap();
        let dev = DeviceInfo {
            id: "x".into(),
            name: "y".into(),
        };
        let events = b.connect_gatt(&dev).unwrap();
        drop(tx);
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(1)),
            Ok(DisconnectReason::LinkLost(_))
        ));
    }
}
