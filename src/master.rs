/*!
    implement the master side of the bus on top of the slave engine.

    The central resource is the [Master] struct, a [Slave] extended with the
    outbound request cycle: [Master::request_from] flushes a request line and
    synchronously waits for the matching response, pumping transport bytes
    through a caller-supplied callback (or its own drain loop) until the
    response is complete or the timeout elapses.

    A master begun with a slave address keeps the full slave behavior and
    answers transmissions and requests addressed to it, even while one of its
    own requests is waiting.
*/

use core::time::Duration;
use std::{
    time::Instant,
    thread,
    };
use alloc::boxed::Box;
use embedded_io::{Read, ReadReady, Write};
use log::*;

use crate::{
    command::{self, Command, Line, OutState, Token},
    slave::{Error, Slave},
    stream::Stream,
    };


/// response waiting time before a request gives up
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// callback pumping transport bytes into the engine while a request waits
pub type PumpCallback<B> = Box<dyn FnMut(&mut Master<B>)>;


/// master side of the bus, a [Slave] plus the request cycle
pub struct Master<B> {
    slave: Slave<B>,
    /// buffer receiving the answer to the pending request
    response: Stream,
    timeout: Duration,
    on_read_serial: Option<PumpCallback<B>>,
}

impl<B: Write> Master<B> {
    pub fn new(bus: B) -> Self {
        Self {
            slave: Slave::new(bus),
            response: Stream::new(),
            timeout: DEFAULT_TIMEOUT,
            on_read_serial: None,
        }
    }

    /// join the bus as a master without a slave role
    pub fn begin(&mut self) -> Result<(), Error<B::Error>> {
        if self.slave.address != command::NOT_INITIALIZED_ADDRESS
            {return Err(Error::AlreadyBegun)}
        self.slave.address = command::MASTER_ADDRESS;
        Ok(())
    }
    /// join the bus as a master also answering as the slave at the given address
    pub fn begin_slave(&mut self, address: u8) -> Result<(), Error<B::Error>> {
        self.slave.begin(address)
    }

    /// forcibly reset all transaction state and release the buffers
    pub fn end(&mut self) {
        self.slave.end();
        self.response.release();
    }

    /// register the callback invoked on a completed inbound transmission
    pub fn on_receive(&mut self, callback: impl FnMut(&mut Stream, usize) + 'static) {
        self.slave.on_receive(callback);
    }
    /// register the callback filling the outbound buffer to answer a request
    pub fn on_request(&mut self, callback: impl FnMut(&mut Stream) + 'static) {
        self.slave.on_request(callback);
    }
    /// register the pump run while waiting for a response
    ///
    /// without one, the engine drains the transport itself
    pub fn on_read_serial(&mut self, callback: impl FnMut(&mut Master<B>) + 'static) {
        self.on_read_serial = Some(Box::new(callback));
    }

    /// response waiting time before a request gives up
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
    pub fn timeout(&self) -> Duration {self.timeout}

    /// change the capacity floor the buffers keep across transactions
    pub fn set_alloc_min_size(&mut self, size: u8) {
        self.slave.set_alloc_min_size(size);
        self.response.set_alloc_min_size(size);
    }
    /// release buffer memory without ending the session
    pub fn release_buffers(&mut self) {
        self.slave.release_buffers();
        self.response.release();
    }

    pub fn bus(&self) -> &B {self.slave.bus()}
    pub fn bus_mut(&mut self) -> &mut B {self.slave.bus_mut()}

    /// unread bytes of the last response
    pub fn available(&self) -> usize {self.response.available()}
    pub fn read(&mut self) -> Option<u8> {self.response.read()}
    pub fn peek(&self) -> Option<u8> {self.response.peek()}
    pub fn read_bytes(&mut self, data: &mut [u8]) -> usize {self.response.read_bytes(data)}

    /// open an outbound transmission toward the given address
    pub fn begin_transmission(&mut self, address: u8) {
        self.slave.begin_transmission(address);
    }
    /// append one byte to the outbound transmission
    pub fn write(&mut self, data: u8) -> usize {self.slave.write(data)}
    /// append a slice to the outbound transmission
    pub fn write_bytes(&mut self, data: &[u8]) -> usize {self.slave.write_bytes(data)}
    /// close the outbound transmission, framing and flushing it to the transport
    pub fn end_transmission(&mut self) -> Result<(), Error<B::Error>> {
        self.slave.end_transmission()
    }

    /// feed one byte from the transport into the engine
    ///
    /// same contract as [Slave::feed], with the response routing on top
    pub fn feed(&mut self, byte: u8) -> Result<(), Error<B::Error>> {
        match self.slave.decoder.feed(&mut self.slave.flags, byte) {
            Some(Token::Byte(data)) => {
                self.route(data);
                Ok(())
            }
            Some(Token::End(line)) => self.finish(line),
            None => Ok(()),
        }
    }

    fn route(&mut self, data: u8) {
        if self.slave.flags.out_state() == OutState::Filling {
            // response payload accumulating
            if self.response.len() >= command::MAX_TRANSMISSION || self.response.write(data) == 0 {
                debug!("oversized response len={}", self.response.len());
                self.slave.discard();
            }
        }
        else if self.slave.flags.in_active() {
            self.slave.fill_input(data);
        }
        else if self.slave.open_input(data) {
            // claimed by the slave role
        }
        else if self.slave.flags.command() == Command::Response
        && self.slave.flags.out_state() == OutState::Pending
        && self.response.len() == 1
        && self.response.get(0) == Some(data) {
            // address confirmed, the line is the answer to the pending request,
            // the address stays buffered for the wait to check
            trace!("response address={:#04x} confirmed", data);
            self.slave.flags.set_out_state(OutState::Filling);
        }
        else {
            trace!("discard address={:#04x} own={:#04x}", data, self.slave.address);
            self.slave.discard();
        }
    }

    fn finish(&mut self, line: Line) -> Result<(), Error<B::Error>> {
        if let Some(data) = line.last {
            self.route(data);
        }
        if !line.integrity_ok
        && matches!(self.slave.flags.command(), Command::Transmit | Command::Request | Command::Response) {
            debug!("integrity mismatch, frame dropped");
            self.slave.discard();
        }
        let flags = self.slave.flags;
        let result = match flags.command() {
            Command::SendDiscarded => self.slave.send_nack(),
            Command::Transmit | Command::Request | Command::Response
                if flags.in_active() || flags.out_is_filling()
                => self.dispatch(),
            _ => Ok(()),
        };
        if self.slave.flags.command() == Command::Discard && self.slave.flags.out_is_filling() {
            // the line went to discard while a response was pending, the
            // request is abandoned rather than fed from a corrupted line
            self.response.clear();
            self.slave.flags.set_out_state(OutState::Idle);
        }
        self.slave.cleanup();
        result
    }

    fn dispatch(&mut self) -> Result<(), Error<B::Error>> {
        match self.slave.flags.command() {
            Command::Request if self.slave.flags.in_active() => {
                if self.slave.flags.out_state() != OutState::Idle {
                    // cannot serve a request while a transaction of ours is in
                    // flight, refuse it instead of queueing
                    return self.slave.send_nack()
                }
                self.slave.answer_request()
            }
            Command::Transmit | Command::Response if self.slave.flags.in_active() => {
                self.slave.deliver();
                Ok(())
            }
            _ => {
                if self.slave.flags.out_state() == OutState::Filling {
                    // line end completes the response
                    self.slave.flags.set_out_state(OutState::Filled);
                }
                Ok(())
            }
        }
    }
}

impl<B: Read + ReadReady + Write> Master<B> {
    /**
        request `count` bytes from the slave at `address` and wait for them.

        Returns the number of bytes received, to be consumed with
        [Master::read]. A zero count or invalid address, and a response that
        does not arrive complete and matching within the timeout, all yield 0.

        The engine blocks cooperatively: the registered pump (or the built-in
        drain loop) runs between yields until the response is complete, so
        unrelated frames arriving meanwhile are still dispatched normally.
    */
    pub fn request_from(&mut self, address: u8, count: u8) -> Result<u8, Error<B::Error>> {
        if count == 0 || !command::is_valid_address(address) {
            debug!("refused request address={:#04x} count={}", address, count);
            return Ok(0)
        }
        debug!("request address={:#04x} count={}", address, count);
        self.slave.flags.set_out_state(OutState::Pending);
        // discard whatever a previous request left over, and pre-load the
        // expected address for the confirmation and the final check
        self.response.clear();
        self.response.write(address);
        if let Err(error) = self.send_request(address, count) {
            self.response.clear();
            self.slave.flags.set_out_state(OutState::Idle);
            return Err(error)
        }
        self.wait_for_response(address, count)
    }

    /// flush the request line as fast as possible
    fn send_request(&mut self, address: u8, count: u8) -> Result<(), Error<B::Error>> {
        self.slave.bus.flush().map_err(Error::Bus)?;
        command::write_frame(&mut self.slave.bus, command::REQUEST_COMMAND, &[address, count])
            .map_err(Error::Bus)?;
        self.slave.bus.flush().map_err(Error::Bus)
    }

    /// pump the transport until the response is complete or the timeout elapses
    fn wait_for_response(&mut self, address: u8, count: u8) -> Result<u8, Error<B::Error>> {
        let deadline = Instant::now() + self.timeout;
        while self.slave.flags.out_is_filling() && Instant::now() <= deadline {
            // nothing else to do, leave resources to the kernel
            thread::yield_now();
            self.pump()?;
        }
        if self.slave.flags.out_state() == OutState::Filled
        && self.response.read() == Some(address) {
            self.slave.flags.set_out_state(OutState::Idle);
            return Ok(count)
        }
        // timeout, wrong address, abandoned fill...
        debug!("no response address={:#04x} state={:?}", address, self.slave.flags.out_state());
        self.response.clear();
        self.slave.flags.set_out_state(OutState::Idle);
        Ok(0)
    }

    /// run the registered pump once, or drain the transport directly
    ///
    /// the callback slot is emptied for the duration of the call, so a wait
    /// re-entered from inside the pump cannot run it twice
    fn pump(&mut self) -> Result<(), Error<B::Error>> {
        if let Some(mut callback) = self.on_read_serial.take() {
            callback(self);
            self.on_read_serial = Some(callback);
            Ok(())
        }
        else {
            self.service()
        }
    }

    /// feed every byte already available on the transport
    pub fn service(&mut self) -> Result<(), Error<B::Error>> {
        while self.slave.bus.read_ready().map_err(Error::Bus)? {
            let mut byte = [0];
            if self.slave.bus.read(&mut byte).map_err(Error::Bus)? == 0
                {break}
            self.feed(byte[0])?;
        }
        Ok(())
    }
}
