use alloc::boxed::Box;
use embedded_io::{Read, ReadReady, Write};
use log::*;
use thiserror::Error;

use crate::{
    command::{self, Command, Decoder, Flags, Line, OutState, Token},
    stream::Stream,
    };


/// error regarding wire transactions
///
/// misuses of the transmission api are distinct variants returned to the
/// caller, never panics. Malformed traffic is not an error at all, it is
/// silently discarded.
#[derive(Error, Debug, PartialEq)]
pub enum Error<E> {
    #[error("problem with the serial bus")]
    Bus(E),
    #[error("address is outside the valid bus range")]
    InvalidAddress,
    #[error("transmission addressed to own address")]
    OwnAddress,
    #[error("end of transmission without a begin")]
    EndWithoutBegin,
    #[error("data is longer than the maximum allowed transmission")]
    DataTooLong,
    #[error("begin called again without an intervening end")]
    AlreadyBegun,
}

/// callback receiving a completed inbound transmission and its number of unread bytes
pub type ReceiveCallback = Box<dyn FnMut(&mut Stream, usize)>;
/// callback filling the outbound buffer to answer a request
pub type RequestCallback = Box<dyn FnMut(&mut Stream)>;


/**
    slave side of the bus.

    Owns one inbound and one outbound [Stream] and demultiplexes incoming
    frames by address: a completed transmission for the own address lands in
    the receive callback, a completed request triggers the request callback
    and answers with whatever it left in the outbound buffer.

    The transport `B` only needs [Write] to answer requests; [Read] and
    [ReadReady] unlock [Slave::service]. Passing `&mut port` keeps the
    transport borrowed, the engine never opens or closes it.
*/
pub struct Slave<B> {
    pub(crate) bus: B,
    pub(crate) address: u8,
    pub(crate) flags: Flags,
    pub(crate) decoder: Decoder,
    /// incoming frame payload
    pub(crate) input: Stream,
    /// outgoing frame payload, user-filled between begin and end of transmission
    pub(crate) output: Stream,
    pub(crate) on_receive: Option<ReceiveCallback>,
    pub(crate) on_request: Option<RequestCallback>,
}

impl<B: Write> Slave<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            address: command::NOT_INITIALIZED_ADDRESS,
            flags: Flags::default(),
            decoder: Decoder::new(),
            input: Stream::new(),
            output: Stream::new(),
            on_receive: None,
            on_request: None,
        }
    }

    /// join the bus as the slave owning the given address
    pub fn begin(&mut self, address: u8) -> Result<(), Error<B::Error>> {
        if !command::is_valid_address(address)
            {return Err(Error::InvalidAddress)}
        if self.address != command::NOT_INITIALIZED_ADDRESS
            {return Err(Error::AlreadyBegun)}
        self.address = address;
        Ok(())
    }

    /// forcibly reset all transaction state and release the buffers
    ///
    /// safe to call in the middle of a transaction, whatever was in flight is
    /// abandoned without a trace on the wire
    pub fn end(&mut self) {
        self.address = command::NOT_INITIALIZED_ADDRESS;
        self.decoder.reset(&mut self.flags);
        self.flags = Flags::default();
        self.input.release();
        self.output.release();
    }

    /// register the callback invoked on a completed inbound transmission
    pub fn on_receive(&mut self, callback: impl FnMut(&mut Stream, usize) + 'static) {
        self.on_receive = Some(Box::new(callback));
    }
    /// register the callback filling the outbound buffer to answer a request
    pub fn on_request(&mut self, callback: impl FnMut(&mut Stream) + 'static) {
        self.on_request = Some(Box::new(callback));
    }

    /// change the capacity floor both buffers keep across transactions
    pub fn set_alloc_min_size(&mut self, size: u8) {
        self.input.set_alloc_min_size(size);
        self.output.set_alloc_min_size(size);
    }
    /// release buffer memory without ending the session
    pub fn release_buffers(&mut self) {
        self.output.release();
        self.input.release();
    }

    pub fn bus(&self) -> &B {&self.bus}
    pub fn bus_mut(&mut self) -> &mut B {&mut self.bus}

    /// unread bytes of the inbound payload, only meaningful inside the receive callback
    pub fn available(&self) -> usize {self.input.available()}
    pub fn read(&mut self) -> Option<u8> {self.input.read()}
    pub fn peek(&self) -> Option<u8> {self.input.peek()}
    pub fn read_bytes(&mut self, data: &mut [u8]) -> usize {self.input.read_bytes(data)}

    /// open an outbound transmission toward the given address
    pub fn begin_transmission(&mut self, address: u8) {
        trace!("begin transmission address={:#04x}", address);
        self.output.clear();
        self.output.write(address);
        self.flags.set_out_state(OutState::Locked);
    }

    /// append one byte to the outbound transmission
    ///
    /// returns the number of bytes written, 0 outside a transmission or on
    /// allocation failure
    pub fn write(&mut self, data: u8) -> usize {
        if !self.flags.out_can_write()
            {return 0}
        self.output.write(data)
    }
    /// append a slice to the outbound transmission
    pub fn write_bytes(&mut self, data: &[u8]) -> usize {
        if !self.flags.out_can_write()
            {return 0}
        self.output.write_bytes(data)
    }

    /// close the outbound transmission, framing and flushing it to the transport
    pub fn end_transmission(&mut self) -> Result<(), Error<B::Error>> {
        if self.flags.out_state() != OutState::Locked
            {return Err(Error::EndWithoutBegin)}
        let Some(address) = self.output.get(0) else {
            // buffer was lost to an allocation failure after the begin
            self.flags.set_out_state(OutState::Idle);
            return Err(Error::EndWithoutBegin)
        };
        if !command::is_valid_address(address) {
            self.abort_transmission();
            return Err(Error::InvalidAddress)
        }
        if address == self.address {
            self.abort_transmission();
            return Err(Error::OwnAddress)
        }
        if self.output.len() > command::MAX_TRANSMISSION {
            self.abort_transmission();
            return Err(Error::DataTooLong)
        }
        self.transmit(command::TRANSMIT_COMMAND)
    }

    fn abort_transmission(&mut self) {
        self.output.clear();
        self.flags.set_out_state(OutState::Idle);
    }

    /// frame and flush the outbound buffer, then return it to idle
    pub(crate) fn transmit(&mut self, keyword: &[u8]) -> Result<(), Error<B::Error>> {
        let result = command::write_frame(&mut self.bus, keyword, self.output.as_slice());
        self.output.clear();
        self.flags.set_out_state(OutState::Idle);
        result.map_err(Error::Bus)
    }

    /// answer with the bare own address, refusing a request without queueing it
    pub(crate) fn send_nack(&mut self) -> Result<(), Error<B::Error>> {
        debug!("nack address={:#04x}", self.address);
        command::write_frame(&mut self.bus, command::RESPONSE_COMMAND, &[self.address])
            .map_err(Error::Bus)
    }

    /**
        feed one byte from the transport into the engine.

        Must be called from ordinary execution context, not from an interrupt
        handler: answering a request writes back to the transport from inside
        this call, and a master waiting in a request pumps this recursively.
    */
    pub fn feed(&mut self, byte: u8) -> Result<(), Error<B::Error>> {
        match self.decoder.feed(&mut self.flags, byte) {
            Some(Token::Byte(data)) => {
                self.route(data);
                Ok(())
            }
            Some(Token::End(line)) => self.finish(line),
            None => Ok(()),
        }
    }

    fn route(&mut self, data: u8) {
        if self.flags.in_active() {
            self.fill_input(data);
        }
        else if !self.open_input(data) {
            trace!("discard address={:#04x} own={:#04x}", data, self.address);
            self.discard();
        }
    }

    /// append one payload byte to the inbound buffer, within the per-kind bound
    pub(crate) fn fill_input(&mut self, data: u8) {
        if self.flags.command() == Command::Request {
            if self.input.len() >= command::MAX_REQUEST_TRANSMISSION {
                debug!("oversized request len={}", self.input.len());
                self.flags.set_command(Command::SendDiscarded);
                return
            }
        }
        else if self.input.len() >= command::MAX_TRANSMISSION {
            debug!("oversized transmission len={}", self.input.len());
            self.discard();
            return
        }
        if self.input.write(data) == 0 {
            // allocation failure degraded the buffer to empty
            if self.flags.command() == Command::Request
                {self.flags.set_command(Command::SendDiscarded)}
            else
                {self.discard()}
        }
    }

    /// decide from the first payload byte whether the frame is ours
    ///
    /// returns false when the address concerns nobody here, leaving the caller
    /// free to claim it for other purposes
    pub(crate) fn open_input(&mut self, data: u8) -> bool {
        if data != self.address
            {return false}
        if self.flags.command() == Command::Response {
            // a response echoing the own address is never consumed
            debug!("discard own response address={:#04x}", data);
            self.discard();
            return true
        }
        self.flags.set_in_active(true);
        if self.input.write(data) == 0 {
            self.discard();
        }
        true
    }

    pub(crate) fn discard(&mut self) {
        self.flags.set_command(Command::Discard);
    }

    fn finish(&mut self, line: Line) -> Result<(), Error<B::Error>> {
        if let Some(data) = line.last {
            self.route(data);
        }
        if !line.integrity_ok
        && matches!(self.flags.command(), Command::Transmit | Command::Request | Command::Response) {
            debug!("integrity mismatch, frame dropped");
            self.discard();
        }
        let result = match self.flags.command() {
            Command::SendDiscarded => self.send_nack(),
            Command::Transmit | Command::Request | Command::Response if self.flags.in_active()
                => self.dispatch(),
            _ => Ok(()),
        };
        self.cleanup();
        result
    }

    pub(crate) fn dispatch(&mut self) -> Result<(), Error<B::Error>> {
        match self.flags.command() {
            Command::Request => self.answer_request(),
            _ => {
                self.deliver();
                Ok(())
            }
        }
    }

    /// consume the leading address and hand the payload to the receive callback
    pub(crate) fn deliver(&mut self) {
        self.input.read();
        let available = self.input.available();
        if available == 0 {
            // address without payload
            return
        }
        if let Some(callback) = self.on_receive.as_mut() {
            callback(&mut self.input, available);
        }
    }

    /// consume the request and answer it
    pub(crate) fn answer_request(&mut self) -> Result<(), Error<B::Error>> {
        self.input.read();
        let Some(count) = self.input.read() else {
            // a request without a count cannot be answered
            debug!("truncated request");
            return Ok(())
        };
        self.respond(count)
    }

    /// let the request callback fill the outbound buffer, pad and respond
    pub(crate) fn respond(&mut self, count: u8) -> Result<(), Error<B::Error>> {
        debug!("request for count={} bytes", count);
        self.begin_transmission(self.address);
        if let Some(callback) = self.on_request.as_mut() {
            callback(&mut self.output);
        }
        // fill up to the requested length, the first slot holds the address
        while self.output.len() <= usize::from(count) {
            if self.output.write(0xff) == 0
                {break}
        }
        self.transmit(command::RESPONSE_COMMAND)
    }

    /// return to the only state a new line may start from
    pub(crate) fn cleanup(&mut self) {
        self.flags.set_in_active(false);
        self.input.clear();
        self.decoder.reset(&mut self.flags);
    }
}

impl<B: Read + ReadReady + Write> Slave<B> {
    /// feed every byte already available on the transport
    pub fn service(&mut self) -> Result<(), Error<B::Error>> {
        while self.bus.read_ready().map_err(Error::Bus)? {
            let mut byte = [0];
            if self.bus.read(&mut byte).map_err(Error::Bus)? == 0
                {break}
            self.feed(byte[0])?;
        }
        Ok(())
    }
}
