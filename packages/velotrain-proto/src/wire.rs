//! Binary framing for the decoder UDP protocol: passing/status/config frame
//! parsing, the THBC checksum, BCD-digit packing and CRC16-MCRF4XX command
//! framing.

use crc::{Crc, CRC_16_MCRF4XX};

use crate::record::{Channel, RawPassing};
use crate::tod::Tod;

pub const ESCAPE: u8 = 0x1b;
pub const ACK_CMD: &[u8] = &[ESCAPE, 0x11];
pub const STAT_CMD: &[u8] = &[ESCAPE, 0x05];
pub const START_CMD: &[u8] = &[ESCAPE, 0x07];
pub const STOP_CMD: &[u8] = &[ESCAPE, 0x13, 0x5c];
pub const QUE_CMD: &[u8] = &[ESCAPE, 0x10];
pub const SETTIME_PREFIX: &[u8] = &[ESCAPE, 0x48];
pub const STA_LVL: &[u8] = &[ESCAPE, 0x1e];
pub const BOX_LVL: &[u8] = &[ESCAPE, 0x1f];

pub const MIN_REFID: i64 = 90000;
pub const MAX_REFID: i64 = 150000;
pub const TRIG_REFID: i64 = 255;

const CRC_MCRF4XX: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("short message")]
    Short,
    #[error("bad frame length")]
    BadLength,
    #[error("checksum mismatch: computed {computed:?} != received {received:?}")]
    Checksum { computed: String, received: String },
    #[error("not utf8/latin1 decodable")]
    Encoding,
    #[error("unrecognised refid: {0}")]
    SpuriousRefid(String),
    #[error("malformed field count")]
    FieldCount,
}

/// Outcome of parsing a single complete line out of a unit's read buffer.
pub enum ParsedFrame {
    Passing(RawPassing),
    /// A passing frame with a spurious (out-of-range) refid; still worth an ack.
    SpuriousPassing,
    Status { tod: Tod, refid: String },
    Config(Vec<u8>),
    /// Malformed/unsupported; nothing to do besides log.
    Ignored,
}

/// `sum(bytes) mod 10000`, rendered as 4 ASCII decimal digits.
pub fn thbc_sum(data: &[u8]) -> String {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    format!("{:04}", sum % 10000)
}

/// Packs an integer 0..=99 into a single decimal-digit-pair byte (BCD-ish,
/// but each nibble holds a decimal digit rather than hex).
pub fn val2hexval(val: u8) -> u8 {
    let mut ret = 0u8;
    ret |= ((val / 10) & 0x0f) << 4;
    ret |= (val % 10) & 0x0f;
    ret
}

pub fn hexval2val(hexval: u8) -> u8 {
    10 * (hexval >> 4) + (hexval & 0x0f)
}

fn channel_for_tag(tag: &str) -> Channel {
    match tag {
        "BOX" => Channel::C2,
        "MAN" => Channel::C0,
        _ => Channel::C1,
    }
}

/// Splits `buf` on the first `CR LF`, locates the earliest of `<`, `[`, `+`
/// within that chunk and parses from there. Returns the parsed frame (if
/// any) and the unconsumed residual.
pub fn take_frame(buf: &[u8]) -> (Option<Result<ParsedFrame, WireError>>, &[u8]) {
    if let Some(pos) = find_crlf(buf) {
        let (chunk, rest) = buf.split_at(pos + 2);
        let start = chunk
            .iter()
            .position(|&b| b == b'<' || b == b'[' || b == b'+');
        let parsed = start.map(|s| parse_message(&chunk[s..]));
        (parsed, rest)
    } else {
        (None, buf)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == [0x0d, 0x0a])
}

fn parse_message(msg: &[u8]) -> Result<ParsedFrame, WireError> {
    if msg.len() <= 4 {
        return Err(WireError::Short);
    }
    match msg[0] {
        b'<' => parse_passing(msg),
        b'[' => parse_status(msg),
        b'+' if msg.len() > 53 && msg.starts_with(b"+++") => Ok(ParsedFrame::Config(msg[3..].to_vec())),
        _ => Ok(ParsedFrame::Ignored),
    }
}

fn parse_passing(msg: &[u8]) -> Result<ParsedFrame, WireError> {
    let idx = msg.iter().position(|&b| b == b'>').ok_or(WireError::BadLength)?;
    if idx != 37 {
        return Err(WireError::BadLength);
    }
    let data = &msg[1..33];
    let msum = &msg[33..37];
    let msum_str = std::str::from_utf8(msum).map_err(|_| WireError::Encoding)?;
    let tsum = thbc_sum(data);
    if tsum != msum_str {
        return Err(WireError::Checksum {
            computed: tsum,
            received: msum_str.to_string(),
        });
    }
    let text = latin1_to_string(data);
    let pvec: Vec<&str> = text.split_whitespace().collect();
    if pvec.len() < 6 {
        return Err(WireError::FieldCount);
    }
    let rawref = pvec[1];
    let refint: i64 = rawref.parse().map_err(|_| WireError::SpuriousRefid(rawref.to_string()))?;
    if !(refint == TRIG_REFID || (refint > MIN_REFID && refint < MAX_REFID)) {
        return Ok(ParsedFrame::SpuriousPassing);
    }
    let refid = rawref.trim_start_matches('0');
    let refid = if refid.is_empty() { "0" } else { refid };
    let channel = channel_for_tag(pvec[0]);
    let tod: Tod = pvec[2].parse().map_err(|_| WireError::Encoding)?;
    let index = format!("{}:{}:{}", pvec[3], pvec[4], pvec[5]);
    let low_battery = pvec[5] == "2";
    let faulty_battery = pvec[5] == "3";
    Ok(ParsedFrame::Passing(RawPassing {
        source: None,
        channel,
        refid: refid.to_string(),
        tod,
        index,
        low_battery,
        faulty_battery,
    }))
}

fn parse_status(msg: &[u8]) -> Result<ParsedFrame, WireError> {
    if msg.len() < 22 {
        return Err(WireError::Short);
    }
    let data = &msg[1..22];
    let text = latin1_to_string(data);
    let pvec: Vec<&str> = text.split_whitespace().collect();
    if pvec.len() != 5 {
        return Err(WireError::FieldCount);
    }
    let tod_str = pvec[0].trim_matches('"');
    let tod: Tod = tod_str.parse().map_err(|_| WireError::Encoding)?;
    let refid = pvec[1..].join(":");
    Ok(ParsedFrame::Status { tod, refid })
}

fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Decoded contents of a `+++` config response (layout fixed by the decoder
/// firmware).
#[derive(Debug, Clone, Default)]
pub struct DecoderConfigFrame {
    pub flags: std::collections::BTreeMap<u8, u32>,
    pub unit_no: String,
    pub version: u8,
    pub ip: [u8; 4],
    pub mask: [u8; 4],
    pub gateway: [u8; 4],
    pub host: [u8; 4],
    pub sta_level: u8,
    pub box_level: u8,
}

pub const CONFIG_TOD: u8 = 0;
pub const CONFIG_GPS: u8 = 1;
pub const CONFIG_TZ_HOUR: u8 = 2;
pub const CONFIG_TZ_MIN: u8 = 3;
pub const CONFIG_485: u8 = 4;
pub const CONFIG_FIBRE: u8 = 5;
pub const CONFIG_PRINT: u8 = 6;
pub const CONFIG_MAX: u8 = 7;
pub const CONFIG_PROT: u8 = 8;
pub const CONFIG_PULSE: u8 = 9;
pub const CONFIG_PULSEINT: u8 = 10;
pub const CONFIG_CELLSYNC: u8 = 11;
pub const CONFIG_CELLTOD_HOUR: u8 = 12;
pub const CONFIG_CELLTOD_MIN: u8 = 13;
pub const CONFIG_ACTIVE_LOOP: u8 = 14;
pub const CONFIG_TONE_STA: u8 = 15;
pub const CONFIG_TONE_BOX: u8 = 17;
pub const CONFIG_TONE_MAN: u8 = 19;
pub const CONFIG_TONE_CEL: u8 = 21;
pub const CONFIG_TONE_BXX: u8 = 23;
pub const CONFIG_SPARE: u8 = 25;
pub const CONFIG_LEN: usize = 27;

const TONE_FLAGS: [u8; 5] = [
    CONFIG_TONE_STA,
    CONFIG_TONE_BOX,
    CONFIG_TONE_MAN,
    CONFIG_TONE_CEL,
    CONFIG_TONE_BXX,
];
const SINGLE_BYTE_FLAGS: [u8; 6] = [
    CONFIG_TZ_HOUR,
    CONFIG_TZ_MIN,
    CONFIG_PROT,
    CONFIG_PULSEINT,
    CONFIG_CELLTOD_HOUR,
    CONFIG_CELLTOD_MIN,
];
const BOOL_FLAGS: [u8; 9] = [
    CONFIG_TOD,
    CONFIG_GPS,
    CONFIG_485,
    CONFIG_FIBRE,
    CONFIG_PRINT,
    CONFIG_MAX,
    CONFIG_PULSE,
    CONFIG_CELLSYNC,
    CONFIG_ACTIVE_LOOP,
];

pub fn parse_config_frame(ibuf: &[u8]) -> Result<DecoderConfigFrame, WireError> {
    if ibuf.len() < 48 {
        return Err(WireError::Short);
    }
    let mut flags = std::collections::BTreeMap::new();
    for &flag in TONE_FLAGS.iter() {
        let v = 100 * hexval2val(ibuf[flag as usize]) as u32 + hexval2val(ibuf[flag as usize + 1]) as u32;
        flags.insert(flag, v);
    }
    for &flag in SINGLE_BYTE_FLAGS.iter() {
        flags.insert(flag, hexval2val(ibuf[flag as usize]) as u32);
    }
    for &flag in BOOL_FLAGS.iter() {
        flags.insert(flag, if ibuf[flag as usize] != 0 { 1 } else { 0 });
    }
    let unit_no: String = ibuf[43..47].iter().map(|&c| (c + b'0') as char).collect();
    let version = hexval2val(ibuf[47]);
    let sta_level = hexval2val(ibuf[CONFIG_SPARE as usize]);
    let box_level = hexval2val(ibuf[CONFIG_SPARE as usize + 1]);
    let mut ip = [0u8; 4];
    let mut mask = [0u8; 4];
    let mut gateway = [0u8; 4];
    let mut host = [0u8; 4];
    if ibuf.len() >= 43 {
        ip.copy_from_slice(&ibuf[27..31]);
        mask.copy_from_slice(&ibuf[31..35]);
        gateway.copy_from_slice(&ibuf[35..39]);
        host.copy_from_slice(&ibuf[39..43]);
    }
    Ok(DecoderConfigFrame {
        flags,
        unit_no,
        version,
        ip,
        mask,
        gateway,
        host,
        sta_level,
        box_level,
    })
}

/// Serialises a flag map into the 27-byte config block sent back to a unit.
pub fn serialise_config(flags: &std::collections::BTreeMap<u8, u32>) -> [u8; CONFIG_LEN] {
    let mut obuf = [0u8; CONFIG_LEN];
    obuf[CONFIG_SPARE as usize] = 0x20;
    obuf[CONFIG_SPARE as usize + 1] = 0x20;
    for &flag in TONE_FLAGS.iter() {
        if let Some(&v) = flags.get(&flag) {
            obuf[flag as usize] = val2hexval((v / 100) as u8);
            obuf[flag as usize + 1] = val2hexval((v % 100) as u8);
        }
    }
    for &flag in SINGLE_BYTE_FLAGS.iter() {
        if let Some(&v) = flags.get(&flag) {
            obuf[flag as usize] = val2hexval((v % 100) as u8);
        }
    }
    for &flag in BOOL_FLAGS.iter() {
        if let Some(&v) = flags.get(&flag) {
            if v != 0 {
                obuf[flag as usize] = 0x01;
            }
        }
    }
    obuf
}

/// Frames a v3 command: `ESC cmd crc16-be '>'`.
pub fn frame_v3_command(cmd: &[u8]) -> Vec<u8> {
    let crc = CRC_MCRF4XX.checksum(cmd);
    let mut out = Vec::with_capacity(cmd.len() + 4);
    out.push(ESCAPE);
    out.extend_from_slice(cmd);
    out.push((crc >> 8) as u8);
    out.push((crc & 0xff) as u8);
    out.push(b'>');
    out
}

/// Builds the 4-byte set-time body (hours, minutes, seconds, terminator).
pub fn set_time_command(tod: Tod) -> Vec<u8> {
    let total_secs = (tod.as_millis() / 1000).rem_euclid(86400) as u32;
    let h = (total_secs / 3600) as u8;
    let m = ((total_secs / 60) % 60) as u8;
    let s = (total_secs % 60) as u8;
    let mut out = Vec::with_capacity(SETTIME_PREFIX.len() + 4);
    out.extend_from_slice(SETTIME_PREFIX);
    out.extend_from_slice(&[h, m, s, 0x74]);
    out
}

pub fn level_command(prefix: &[u8], level: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 2);
    out.extend_from_slice(prefix);
    out.extend_from_slice(format!("{:02}", level).as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_roundtrips() {
        let data = b"STA 123456 12:00:00.000 0 0 0 pad to thirty two!";
        let data = &data[..32];
        let sum = thbc_sum(data);
        assert_eq!(sum.len(), 4);
        assert!(sum.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn hexval_roundtrips_all_two_digit_values() {
        for v in 0..100u8 {
            assert_eq!(hexval2val(val2hexval(v)), v);
        }
    }

    #[test]
    fn parses_valid_passing_frame() {
        let mut payload = format!("STA 90001 12:00:00.000 1 2 0").into_bytes();
        payload.resize(32, b' ');
        let sum = thbc_sum(&payload);
        let mut msg = Vec::new();
        msg.push(b'<');
        msg.extend_from_slice(&payload);
        msg.extend_from_slice(sum.as_bytes());
        msg.push(b'>');
        match parse_message(&msg).unwrap() {
            ParsedFrame::Passing(p) => {
                assert_eq!(p.refid, "90001");
                assert_eq!(p.channel, Channel::C1);
                assert_eq!(p.index, "1:2:0");
                assert!(!p.low_battery);
            }
            _ => panic!("expected passing frame"),
        }
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut payload = format!("STA 90001 12:00:00.000 1 2 0").into_bytes();
        payload.resize(32, b' ');
        let mut msg = Vec::new();
        msg.push(b'<');
        msg.extend_from_slice(&payload);
        msg.extend_from_slice(b"9999");
        msg.push(b'>');
        assert!(matches!(parse_message(&msg), Err(WireError::Checksum { .. })));
    }

    #[test]
    fn spurious_refid_is_flagged_not_parsed() {
        let mut payload = format!("STA 12 12:00:00.000 1 2 0").into_bytes();
        payload.resize(32, b' ');
        let sum = thbc_sum(&payload);
        let mut msg = Vec::new();
        msg.push(b'<');
        msg.extend_from_slice(&payload);
        msg.extend_from_slice(sum.as_bytes());
        msg.push(b'>');
        assert!(matches!(parse_message(&msg).unwrap(), ParsedFrame::SpuriousPassing));
    }

    #[test]
    fn frames_v3_command_with_crc() {
        let framed = frame_v3_command(&[0x08, 0x08]);
        assert_eq!(framed[0], ESCAPE);
        assert_eq!(*framed.last().unwrap(), b'>');
        assert_eq!(framed.len(), 2 + 2 + 2);
    }

    #[test]
    fn set_time_encodes_hms() {
        let tod = Tod::from_secs_f64(3723.0); // 01:02:03
        let cmd = set_time_command(tod);
        assert_eq!(&cmd[2..6], &[1, 2, 3, 0x74]);
    }
}
