use bilge::prelude::*;
use embedded_io::Write;
use log::*;


/// keyword opening a master to slave payload transmission
pub const TRANSMIT_COMMAND: &[u8] = b"+I2CT=";
/// keyword opening a master request for bytes from a slave
pub const REQUEST_COMMAND: &[u8] = b"+I2CR=";
/// keyword opening a slave answer to a request
pub const RESPONSE_COMMAND: &[u8] = b"+I2CA=";

/// length of every keyword, bounding the scratch accumulator
pub const COMMAND_LENGTH: usize = 6;

/// maximum decoded payload per transmission, longer lines are discarded
pub const MAX_TRANSMISSION: usize = 254;
/// a request payload is exactly an address and a count
pub const MAX_REQUEST_TRANSMISSION: usize = 2;

pub const MIN_ADDRESS: u8 = 0x00;
/// up to 0x7f, the rest is reserved
pub const MAX_ADDRESS: u8 = 0x7f;
/// address of an engine before begin
pub const NOT_INITIALIZED_ADDRESS: u8 = 0xfe;
/// address assigned to a master running without a slave role
pub const MASTER_ADDRESS: u8 = 0xff;

/// character opening the integrity suffix of a line
pub const CRC_MARKER: u8 = b'#';
/// all-ones seed of the integrity checksum
#[cfg(feature = "crc")]
pub const CRC_SEED: u16 = 0xffff;

pub fn is_valid_address(address: u8) -> bool {
    (MIN_ADDRESS ..= MAX_ADDRESS).contains(&address)
}


/// kind of bus message carried by the line being parsed
#[bitsize(3)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq)]
pub enum Command {
    #[default]
    None = 0,
    /// rest of the line is skipped without any effect
    #[fallback]
    Discard = 1,
    /// master to slave payload delivery
    Transmit = 2,
    /// master asking a slave for a number of bytes
    Request = 3,
    /// slave answer to a request
    Response = 4,
    /// rest of the line is skipped, but a nack is still sent at its end
    SendDiscarded = 5,
}

/// lifecycle of the outbound buffer across a transmission or request cycle
#[bitsize(3)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq)]
pub enum OutState {
    /// no outbound transaction in progress
    #[default]
    #[fallback]
    Idle = 0,
    /// outbound buffer reserved by a begin of transmission
    Locked = 1,
    /// request flushed, response address not confirmed yet
    Pending = 2,
    /// response address confirmed, payload accumulating
    Filling = 3,
    /// response complete, waiting to be consumed
    Filled = 4,
}

/// packed session state of an engine
///
/// this is the single authoritative record of what the engine is doing, a new
/// line may only start when command is [Command::None], the inbound buffer is
/// inactive and the outbound state idle
#[bitsize(8)]
#[derive(Copy, Clone, FromBits, DebugBits, PartialEq, Default)]
pub struct Flags {
    /// kind of the line currently being parsed
    pub command: Command,
    /// outbound buffer lifecycle
    pub out_state: OutState,
    /// integrity suffix marker seen on the current line
    pub crc_marker: bool,
    /// inbound buffer is accepting payload for the current line
    pub in_active: bool,
}

impl Flags {
    /// the outbound buffer accepts user writes
    pub fn out_can_write(&self) -> bool {
        self.out_state() == OutState::Locked
    }
    /// a response to a pending request is expected or accumulating
    pub fn out_is_filling(&self) -> bool {
        matches!(self.out_state(), OutState::Pending | OutState::Filling)
    }
}


/// outcome of feeding one byte to the [Decoder]
pub(crate) enum Token {
    /// one decoded payload byte
    Byte(u8),
    /// line terminator reached
    End(Line),
}

/// summary of a completed line
pub(crate) struct Line {
    /// trailing hex pair the terminator forced out of the scratch
    pub last: Option<u8>,
    /// integrity suffix verdict, always true without the crc feature
    pub integrity_ok: bool,
}

/**
    single-pass incremental parser of the line format.

    ```text
    "+" KEYWORD "=" hex-pair... ["#" crc16-hex] "\n"
    ```

    Bytes arrive one at a time with no lookahead. The scratch accumulator is
    bounded by the keyword length and compared against the keyword set after
    every appended character, so there is never any backtracking. Any protocol
    violation moves the command to [Command::Discard] and the rest of the line
    is swallowed without effect.

    The command kind and suffix marker live in the engine's [Flags] record, the
    decoder only owns its scratch and checksum accumulators.
*/
#[derive(Default)]
pub(crate) struct Decoder {
    scratch: heapless::Vec<u8, COMMAND_LENGTH>,
    #[cfg(feature = "crc")]
    crc: u16,
    #[cfg(feature = "crc")]
    crc_received: Option<u16>,
}

impl Decoder {
    pub fn new() -> Self {Self::default()}

    /// advance the parser by one byte
    pub fn feed(&mut self, flags: &mut Flags, byte: u8) -> Option<Token> {
        // terminator first, it always ends the line whatever the state
        if byte == b'\n' {
            return Some(Token::End(self.terminate(flags)))
        }
        if matches!(flags.command(), Command::Discard | Command::SendDiscarded) || byte == b'\r' {
            return None
        }
        if flags.command() == Command::None {
            // accumulating a keyword
            if (self.scratch.is_empty() && byte != b'+') || self.scratch.len() >= COMMAND_LENGTH {
                trace!("discard byte={:#04x}", byte);
                flags.set_command(Command::Discard);
                return None
            }
            let _ = self.scratch.push(byte);
            if let Some(command) = match_command(&self.scratch) {
                flags.set_command(command);
                self.scratch.clear();
                #[cfg(feature = "crc")]
                {
                    self.crc = CRC_SEED;
                    self.crc_received = None;
                }
            }
            return None
        }
        #[cfg(feature = "crc")]
        if byte == CRC_MARKER && !flags.crc_marker() {
            if !self.scratch.is_empty() {
                // suffix in the middle of a hex pair
                debug!("discard, crc marker over a pending pair");
                flags.set_command(Command::Discard);
                return None
            }
            flags.set_crc_marker(true);
            return None
        }
        if byte.is_ascii_hexdigit() {
            let _ = self.scratch.push(byte);
            #[cfg(feature = "crc")]
            if flags.crc_marker() {
                if self.crc_received.is_some() {
                    // digits beyond a complete suffix
                    debug!("discard, oversized crc suffix");
                    flags.set_command(Command::Discard);
                }
                else if self.scratch.len() == 4 {
                    self.crc_received = Some(parse_hex(&self.scratch));
                    self.scratch.clear();
                }
                return None
            }
            if self.scratch.len() == 2 {
                let data = parse_hex(&self.scratch) as u8;
                self.scratch.clear();
                #[cfg(feature = "crc")]
                {self.crc = crc16_update(self.crc, data);}
                return Some(Token::Byte(data))
            }
            return None
        }
        if byte == b',' || byte.is_ascii_whitespace() {
            // separators between pairs
            return None
        }
        trace!("discard byte={:#04x}", byte);
        flags.set_command(Command::Discard);
        None
    }

    /// close the line, flushing a trailing pair and judging the integrity suffix
    fn terminate(&mut self, flags: &mut Flags) -> Line {
        let mut last = None;
        if matches!(flags.command(), Command::Transmit | Command::Request | Command::Response)
        && !flags.crc_marker()
        && !self.scratch.is_empty() {
            // the terminator forces whatever pair is pending, a lone digit
            // parses as its own value
            let data = parse_hex(&self.scratch) as u8;
            #[cfg(feature = "crc")]
            {self.crc = crc16_update(self.crc, data);}
            last = Some(data);
        }
        #[cfg(feature = "crc")]
        let integrity_ok = flags.crc_marker() && self.crc_received == Some(self.crc);
        #[cfg(not(feature = "crc"))]
        let integrity_ok = true;
        Line {last, integrity_ok}
    }

    /// forget any in-flight line
    pub fn reset(&mut self, flags: &mut Flags) {
        self.scratch.clear();
        flags.set_command(Command::None);
        flags.set_crc_marker(false);
        #[cfg(feature = "crc")]
        {
            self.crc = CRC_SEED;
            self.crc_received = None;
        }
    }
}

/// compare the scratch against the keyword set, case-insensitive
fn match_command(scratch: &[u8]) -> Option<Command> {
    if scratch.eq_ignore_ascii_case(TRANSMIT_COMMAND)
        {Some(Command::Transmit)}
    else if scratch.eq_ignore_ascii_case(REQUEST_COMMAND)
        {Some(Command::Request)}
    else if scratch.eq_ignore_ascii_case(RESPONSE_COMMAND)
        {Some(Command::Response)}
    else
        {None}
}

/// value of validated hex digits, most significant first
fn parse_hex(digits: &[u8]) -> u16 {
    digits.iter().fold(0, |value, &digit| (value << 4) | u16::from(hex_value(digit)))
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0' ..= b'9' => digit - b'0',
        b'a' ..= b'f' => digit - b'a' + 0xa,
        b'A' ..= b'F' => digit - b'A' + 0xa,
        _ => 0,
    }
}


/// frame a payload on the wire: keyword, lowercase hex pairs, optional integrity suffix, terminator
pub fn write_frame<B: Write>(bus: &mut B, command: &[u8], payload: &[u8]) -> Result<(), B::Error> {
    bus.write_all(command)?;
    #[cfg(feature = "crc")]
    let mut crc = CRC_SEED;
    for &data in payload {
        #[cfg(feature = "crc")]
        {crc = crc16_update(crc, data);}
        write_hex(bus, data)?;
    }
    #[cfg(feature = "crc")]
    {
        bus.write_all(&[CRC_MARKER])?;
        write_hex(bus, (crc >> 8) as u8)?;
        write_hex(bus, crc as u8)?;
    }
    bus.write_all(b"\n")
}

fn write_hex<B: Write>(bus: &mut B, data: u8) -> Result<(), B::Error> {
    bus.write_all(&[nibble(data >> 4), nibble(data & 0xf)])
}

fn nibble(value: u8) -> u8 {
    if value < 0xa {value + b'0'} else {value - 0xa + b'a'}
}

/// advance the running integrity checksum by one payload byte
#[cfg(feature = "crc")]
pub fn crc16_update(mut crc: u16, data: u8) -> u16 {
    crc ^= u16::from(data);
    for _ in 0 .. 8 {
        if crc & 1 != 0
            {crc = (crc >> 1) ^ 0xa001}
        else
            {crc >>= 1}
    }
    crc
}


#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn drive(line: &[u8]) -> (Vec<u8>, Option<Line>, Flags) {
        let mut decoder = Decoder::new();
        let mut flags = Flags::default();
        let mut bytes = Vec::new();
        let mut end = None;
        for &byte in line {
            match decoder.feed(&mut flags, byte) {
                Some(Token::Byte(data)) => bytes.push(data),
                Some(Token::End(line)) => end = Some(line),
                None => (),
            }
        }
        (bytes, end, flags)
    }

    /// frame a payload the way the engines do, so tests hold with or without crc
    fn framed(command: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        write_frame(&mut wire, command, payload).unwrap();
        wire
    }

    #[test]
    fn decodes_own_frames() {
        let (bytes, end, _) = drive(&framed(TRANSMIT_COMMAND, &[0x10, 0xaa, 0xbb]));
        assert_eq!(bytes, &[0x10, 0xaa, 0xbb]);
        let end = end.unwrap();
        assert_eq!(end.last, None);
        assert!(end.integrity_ok);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let (bytes, _, flags) = drive(b"+i2cT=10ff");
        assert_eq!(flags.command(), Command::Transmit);
        assert_eq!(bytes, &[0x10, 0xff]);
    }

    #[test]
    fn separators_are_skipped() {
        let (bytes, _, _) = drive(b"+I2CT=10,aa Bb\t0c");
        assert_eq!(bytes, &[0x10, 0xaa, 0xbb, 0x0c]);
    }

    #[test]
    fn unknown_keyword_discards() {
        let (bytes, _, flags) = drive(b"+I2CX=1020");
        assert_eq!(flags.command(), Command::Discard);
        assert!(bytes.is_empty());
    }

    #[test]
    fn line_must_open_with_plus() {
        let (bytes, _, flags) = drive(b"I2CT=10");
        assert_eq!(flags.command(), Command::Discard);
        assert!(bytes.is_empty());
    }

    #[test]
    fn invalid_payload_byte_discards() {
        let (bytes, _, flags) = drive(b"+I2CT=10zz");
        assert_eq!(flags.command(), Command::Discard);
        assert_eq!(bytes, &[0x10]);
    }

    #[test]
    #[cfg(not(feature = "crc"))]
    fn terminator_flushes_trailing_pair() {
        let (bytes, end, _) = drive(b"+I2CT=10aa\n");
        assert_eq!(bytes, &[0x10]);
        assert_eq!(end.unwrap().last, Some(0xaa));
    }

    #[test]
    #[cfg(not(feature = "crc"))]
    fn lone_digit_parses_as_its_value() {
        let (bytes, end, _) = drive(b"+I2CT=10a\n");
        assert_eq!(bytes, &[0x10]);
        assert_eq!(end.unwrap().last, Some(0x0a));
    }

    #[test]
    fn carriage_return_is_ignored() {
        let wire: Vec<u8> = framed(RESPONSE_COMMAND, &[0x42, 0x01]).iter()
            .flat_map(|&byte|  if byte == b'\n' {[b'\r', b'\n']} else {[byte, b'\r']})
            .collect();
        let (bytes, end, _) = drive(&wire);
        assert_eq!(bytes, &[0x42, 0x01]);
        assert!(end.unwrap().integrity_ok);
    }

    #[test]
    fn next_line_starts_clean_after_garbage() {
        let mut decoder = Decoder::new();
        let mut flags = Flags::default();
        for &byte in b"watwat\n" {
            decoder.feed(&mut flags, byte);
        }
        // the terminator resets nothing by itself, the engine does, emulate it
        decoder.reset(&mut flags);
        let mut bytes = Vec::new();
        for &byte in framed(REQUEST_COMMAND, &[0x21, 0x04]).as_slice() {
            if let Some(Token::Byte(data)) = decoder.feed(&mut flags, byte) {
                bytes.push(data);
            }
        }
        assert_eq!(flags.command(), Command::Request);
        assert_eq!(bytes, &[0x21, 0x04]);
    }

    #[test]
    #[cfg(feature = "crc")]
    fn crc16_known_vector() {
        let crc = b"123456789".iter().fold(CRC_SEED, |crc, &byte| crc16_update(crc, byte));
        assert_eq!(crc, 0x4b37);
    }

    #[test]
    #[cfg(feature = "crc")]
    fn suffix_verifies() {
        let (bytes, end, _) = drive(&framed(TRANSMIT_COMMAND, &[0x10, 0xaa]));
        assert_eq!(bytes, &[0x10, 0xaa]);
        assert!(end.unwrap().integrity_ok);
    }

    #[test]
    #[cfg(feature = "crc")]
    fn corrupted_suffix_fails() {
        let mut wire = framed(TRANSMIT_COMMAND, &[0x10, 0xaa]);
        // flip one digit of the suffix
        let at = wire.len() - 2;
        wire[at] = if wire[at] == b'0' {b'1'} else {b'0'};
        let (_, end, _) = drive(&wire);
        assert!(!end.unwrap().integrity_ok);
    }

    #[test]
    #[cfg(feature = "crc")]
    fn missing_suffix_fails() {
        let (_, end, _) = drive(b"+I2CT=10aa\n");
        assert!(!end.unwrap().integrity_ok);
    }

    #[test]
    fn frames_are_lowercase_hex() {
        let wire = framed(TRANSMIT_COMMAND, &[0x0a, 0xff]);
        assert!(wire.starts_with(b"+I2CT=0aff"));
        assert!(wire.ends_with(b"\n"));
    }
}
