//! Streaming a transaction payload through `embedded-io-async`.

use embedded_io_async::{ErrorType, Write};
use flashvar_adapters::FlashDevice;

use crate::error::Error;
use crate::ftw::engine::{FtwEngine, TransactionHandle};
use crate::relay::SecureRelay;

/// Sequential writer over an open transaction.
///
/// Each `write` lands at the current position; `commit` finishes the
/// transaction. Dropping the writer without committing abandons it.
pub struct TransactionWriter<'a, F, R> {
    engine: &'a mut FtwEngine<F, R>,
    handle: TransactionHandle,
    position: u32,
}

impl<'a, F: FlashDevice, R: SecureRelay> TransactionWriter<'a, F, R> {
    pub(crate) fn new(engine: &'a mut FtwEngine<F, R>, handle: TransactionHandle) -> Self {
        Self {
            engine,
            handle,
            position: 0,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Bytes left before the transaction is full.
    pub fn remaining(&self) -> u32 {
        self.handle.len() - self.position
    }

    /// Commit the transaction.
    pub async fn commit(self) -> Result<(), Error<F::Error>> {
        self.engine.commit(self.handle).await
    }
}

impl<F: FlashDevice, R: SecureRelay> ErrorType for TransactionWriter<'_, F, R> {
    type Error = Error<F::Error>;
}

impl<F: FlashDevice, R: SecureRelay> Write for TransactionWriter<'_, F, R> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let room = self.remaining() as usize;
        if room == 0 {
            return Err(Error::OutOfResources("transaction payload is full"));
        }
        let n = buf.len().min(room);
        self.engine
            .write(&self.handle, self.position, &buf[..n])
            .await?;
        self.position += n as u32;
        Ok(n)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
