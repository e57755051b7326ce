use std::io::{self, Read};

/// Growable receive buffer used by TCP connections and the WebSocket layer
/// built on top of them.
///
/// Unlike the teacher's length-prefixed `TcpStream`, a connection here has no
/// built-in framing: the reactor just accumulates bytes and hands the entire
/// buffered slice to `on_data_received`, which reports how many leading bytes
/// it consumed. `consume` then trims that prefix from the front.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    buf: Vec<u8>,
    filled: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new(), filled: 0 }
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Drops the first `n` consumed bytes, shifting the remainder down.
    ///
    /// # Panics
    /// Panics if `n` exceeds the number of filled bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.filled, "consumed more bytes than were buffered");
        if n == 0 {
            return;
        }
        self.buf.drain(..n);
        self.filled -= n;
    }

    /// Reads from `source` into the buffer until it would block, the peer
    /// disconnects, or `tick_ceiling` bytes have been read in this call.
    ///
    /// Returns the number of bytes read. `Ok(0)` with a growth of zero means
    /// the peer half-closed the stream (EOF).
    pub fn fill_from<R: Read>(
        &mut self,
        source: &mut R,
        grow_step: usize,
        tick_ceiling: usize,
    ) -> io::Result<FillOutcome> {
        let mut total_read = 0usize;

        loop {
            if total_read >= tick_ceiling {
                return Ok(FillOutcome::CeilingReached { total_read });
            }

            let spare = self.buf.len() - self.filled;
            if spare == 0 {
                let growth = grow_step.max(self.buf.len() - self.filled);
                self.buf.resize(self.buf.len() + growth, 0);
            }

            let spare = self.buf.len() - self.filled;
            let remaining_budget = tick_ceiling - total_read;
            let want = spare.min(remaining_budget);

            match source.read(&mut self.buf[self.filled..self.filled + want]) {
                Ok(0) => return Ok(FillOutcome::Eof { total_read }),
                Ok(n) => {
                    self.filled += n;
                    total_read += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillOutcome::WouldBlock { total_read });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    WouldBlock { total_read: usize },
    CeilingReached { total_read: usize },
    Eof { total_read: usize },
}
