//! The FTW transaction state machine and its recovery pass.

use crc::Crc;
use flashvar_adapters::{ERASED_BYTE, FlashDevice, FlashRegion};

use crate::config::FtwConfig;
use crate::error::Error;
use crate::ftw::layout::{
    self, ERASED_CRC, FLAGS_OFFSET, PAYLOAD_CRC_OFFSET, PHASE_OFFSET, TransactionRecord,
    WORKING_BLOCK_LEN, WorkingBlockRead,
};
use crate::ftw::writer::TransactionWriter;
use crate::guid::Guid;
use crate::marker::{FlashMarker, TxnPhase, WorkingBlockState};
use crate::relay::{RestorePolicy, SecureRelay};

/// Relay tag under which the in-flight transaction record is kept.
pub const FTW_RECORD_TAG: Guid = Guid::from_fields(
    0x3c1d_5e0a,
    0x8f2b,
    0x4d71,
    [0x9a, 0x64, 0x0b, 0xe2, 0x57, 0xc3, 0x1f, 0x88],
);

const COPY_CHUNK: usize = 256;

/// Engine state as seen by callers.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtwState {
    /// No transaction open.
    Idle,
    /// A transaction is open and its payload is streaming into the spare.
    SpareWriting,
}

/// What [`FtwEngine::recover`] found and did.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing to do.
    Idle,
    /// The spare never completed; the target was left untouched.
    RolledBack,
    /// The spare was complete; the target was rewritten from it.
    Replayed,
    /// The target was already complete; only the record was cleared.
    Cleared,
}

/// Proof that a transaction is open. Consumed by [`FtwEngine::commit`].
#[derive(Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    id: u32,
    target: u32,
    length: u32,
}

impl TransactionHandle {
    /// First byte the transaction replaces.
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Number of bytes the transaction replaces.
    pub fn len(&self) -> u32 {
        self.length
    }

    /// Transactions are never empty; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    id: u32,
    record: TransactionRecord,
    length: u32,
    cursor: u32,
}

/// Fault-tolerant write engine.
///
/// Makes "replace `length` bytes at `target`" atomic with respect to power
/// loss. New content is staged in the spare region together with the rest of
/// the erase blocks it touches; the working block records where it goes.
///
/// ```text
///   begin ──► write* ──► commit
///     │         │          ├─ payload CRC, SpareComplete   (point of no return)
///     │         │          ├─ erase target, copy spare
///     │         │          └─ DestinationComplete, record cleared
///     │         └─ spare only
///     └─ spare prepared, record written, WorkingBlockValid
/// ```
///
/// A transaction that is never committed is indistinguishable from one cut
/// short by power loss; [`recover`](Self::recover) resolves both.
pub struct FtwEngine<F, R> {
    flash: F,
    relay: R,
    config: FtwConfig,
    crc: Crc<u32>,
    working_span: FlashRegion,
    open: Option<OpenTransaction>,
    next_id: u32,
}

impl<F: FlashDevice, R: SecureRelay> FtwEngine<F, R> {
    /// Create an engine over `flash`, checkpointing through `relay`.
    ///
    /// Does not touch flash; call [`recover`](Self::recover) once per boot
    /// before using the target regions.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the regions are misaligned, overlap, or leave
    /// the device.
    pub fn new(flash: F, relay: R, config: FtwConfig) -> Result<Self, Error<F::Error>> {
        let erase_size = flash.erase_size();
        let capacity = flash.capacity();
        let working = config.working_region;
        let spare = config.spare_region;

        if !spare.is_aligned_to(erase_size) || working.offset() % erase_size != 0 {
            return Err(Error::InvalidParameter("FTW regions must be erase-aligned"));
        }
        let working_span =
            FlashRegion::erase_span(working.offset(), WORKING_BLOCK_LEN as u32, erase_size)
                .filter(|span| working.contains_range(span.offset(), span.len()))
                .ok_or(Error::InvalidParameter("working region too small"))?;
        if working.end() > capacity || spare.end() > capacity {
            return Err(Error::InvalidParameter("FTW region outside device"));
        }
        if working.overlaps(&spare) {
            return Err(Error::InvalidParameter("working and spare regions overlap"));
        }

        Ok(Self {
            flash,
            relay,
            crc: Crc::<u32>::new(config.crc),
            config,
            working_span,
            open: None,
            next_id: 0,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &FtwConfig {
        &self.config
    }

    /// Largest number of bytes one transaction can replace, when its target
    /// is erase-aligned.
    pub fn max_transaction_len(&self) -> u32 {
        self.config.spare_region.len()
    }

    /// Whether a transaction is open.
    pub fn state(&self) -> FtwState {
        if self.open.is_some() {
            FtwState::SpareWriting
        } else {
            FtwState::Idle
        }
    }

    /// The flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Direct device access, for writes that only clear bits on bytes no
    /// transaction covers.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// The relay.
    pub fn relay_mut(&mut self) -> &mut R {
        &mut self.relay
    }

    /// Split into device and relay.
    pub fn into_parts(self) -> (F, R) {
        (self.flash, self.relay)
    }

    /// Open a transaction replacing `[target, target + length)`.
    ///
    /// Bytes of the range that are never written read back erased after
    /// commit. Bytes of the surrounding erase blocks are preserved.
    ///
    /// # Errors
    ///
    /// - `OutOfResources` if a transaction is already open
    /// - `InvalidParameter` if the range is empty, leaves the device,
    ///   touches the FTW regions, or its erase span exceeds the spare region
    pub async fn begin(
        &mut self,
        target: u32,
        length: u32,
    ) -> Result<TransactionHandle, Error<F::Error>> {
        if self.open.is_some() {
            return Err(Error::OutOfResources("a transaction is already open"));
        }
        if length == 0 {
            return Err(Error::InvalidParameter("empty transaction"));
        }
        let span = FlashRegion::erase_span(target, length, self.flash.erase_size())
            .ok_or(Error::InvalidParameter("transaction range overflows"))?;
        if span.end() > self.flash.capacity() {
            return Err(Error::InvalidParameter("transaction outside device"));
        }
        if span.len() > self.config.spare_region.len() {
            return Err(Error::InvalidParameter("transaction larger than spare region"));
        }
        if span.overlaps(&self.config.spare_region) || span.overlaps(&self.working_span) {
            return Err(Error::InvalidParameter("transaction overlaps FTW regions"));
        }

        let outcome = self.recover().await?;
        if outcome != RecoveryOutcome::Idle {
            info!("ftw: resolved an abandoned transaction before begin");
        }

        let spare = self.config.spare_region.offset();
        self.flash
            .erase(spare, span.len())
            .await
            .map_err(Error::Device)?;
        let payload_offset = target - span.offset();
        let suffix = target + length;
        self.copy(span.offset(), spare, payload_offset).await?;
        self.copy(suffix, spare + (suffix - span.offset()), span.end() - suffix)
            .await?;

        let record = TransactionRecord {
            phase: TxnPhase::Allocated,
            payload_crc: ERASED_CRC,
            target: span.offset(),
            spare,
            span_len: span.len(),
            payload_offset,
        };
        let image = layout::encode(&record, &self.crc);
        self.flash
            .erase(self.working_span.offset(), self.working_span.len())
            .await
            .map_err(Error::Device)?;
        self.flash
            .write(self.working_span.offset(), &image)
            .await
            .map_err(Error::Device)?;
        self.checkpoint(&image, RestorePolicy::RestoreInPlace);
        self.program_flags(WorkingBlockState::Erased, WorkingBlockState::Valid)
            .await?;

        self.next_id = self.next_id.wrapping_add(1);
        self.open = Some(OpenTransaction {
            id: self.next_id,
            record,
            length,
            cursor: 0,
        });
        debug!(
            "ftw: transaction {} open, {:#x}+{:#x} in span {:#x}+{:#x}",
            self.next_id,
            target,
            length,
            span.offset(),
            span.len()
        );
        Ok(TransactionHandle {
            id: self.next_id,
            target,
            length,
        })
    }

    /// Stream `bytes` to `offset` within the transaction.
    ///
    /// Offsets must not go backwards. A device failure abandons the
    /// transaction; start again with [`begin`](Self::begin).
    pub async fn write(
        &mut self,
        handle: &TransactionHandle,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), Error<F::Error>> {
        let open = self.open_for(handle)?;
        if offset < open.cursor {
            return Err(Error::InvalidParameter("transaction writes must not go backwards"));
        }
        let end = u32::try_from(bytes.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|end| *end <= open.length)
            .ok_or(Error::InvalidParameter("write past end of transaction"))?;
        if bytes.is_empty() {
            return Ok(());
        }

        let address = open.record.spare + open.record.payload_offset + offset;
        if let Err(e) = self.flash.write(address, bytes).await {
            warn!("ftw: spare write failed, abandoning transaction {}", open.id);
            self.abandon().await;
            return Err(Error::Device(e));
        }
        if let Some(open) = self.open.as_mut() {
            open.cursor = end;
        }
        Ok(())
    }

    /// A writer streaming through [`embedded_io_async::Write`].
    pub fn writer(&mut self, handle: TransactionHandle) -> TransactionWriter<'_, F, R> {
        TransactionWriter::new(self, handle)
    }

    /// Make the staged content durable at the target.
    ///
    /// Once the spare is marked complete the transaction will finish even if
    /// this call fails part way: the error is reported and the next
    /// [`recover`](Self::recover) completes it.
    pub async fn commit(&mut self, handle: TransactionHandle) -> Result<(), Error<F::Error>> {
        let open = self.open_for(&handle)?;
        self.open = None;
        let mut record = open.record;

        let sum = self.span_crc(record.spare, record.span_len).await?;
        self.flash
            .write(
                self.working_span.offset() + PAYLOAD_CRC_OFFSET,
                &sum.to_le_bytes(),
            )
            .await
            .map_err(Error::Device)?;
        record.payload_crc = sum;
        self.program_phase(&mut record, TxnPhase::SpareComplete)
            .await?;
        self.checkpoint(&layout::encode(&record, &self.crc), RestorePolicy::RestoreInPlace);
        debug!("ftw: transaction {} spare complete", open.id);

        self.apply(&mut record).await?;
        debug!("ftw: transaction {} committed", open.id);
        Ok(())
    }

    /// Resolve whatever the working block records. Run once per boot before
    /// the target regions are read.
    ///
    /// Idempotent: running it again, or after a power loss during itself,
    /// reaches the same flash image. When the working block's signature is
    /// unreadable, an in-flight transaction is resolved from the relay copy.
    ///
    /// # Errors
    ///
    /// `Corrupt` if the record fails its CRC while `WorkingBlockValid` is set
    /// and the relay holds no copy that agrees with it, or if a complete
    /// spare no longer matches its checksum.
    pub async fn recover(&mut self) -> Result<RecoveryOutcome, Error<F::Error>> {
        if let Some(open) = self.open.take() {
            warn!("ftw: transaction {} abandoned", open.id);
        }

        let mut image = [0u8; WORKING_BLOCK_LEN];
        self.flash
            .read(self.working_span.offset(), &mut image)
            .await
            .map_err(Error::Device)?;

        let (flags, record) = match layout::decode(&image, &self.crc) {
            WorkingBlockRead::Erased => return Ok(RecoveryOutcome::Idle),
            WorkingBlockRead::Unrecognised => return self.recover_from_relay(&image).await,
            WorkingBlockRead::Recorded { flags, record } => (flags, record),
        };
        if !flags.is_trustworthy() {
            trace!("ftw: working block holds no live record");
            return Ok(RecoveryOutcome::Idle);
        }

        let mut record = match record {
            Ok(record) => record,
            Err(_) => match self.relay_record(&image) {
                Some(record) => {
                    warn!("ftw: working block CRC mismatch, using the relay copy");
                    record
                }
                None => {
                    error!("ftw: working block CRC mismatch and no usable relay copy");
                    return Err(Error::Corrupt("working block CRC mismatch"));
                }
            },
        };

        match record.phase {
            TxnPhase::Allocated => {
                self.program_flags(WorkingBlockState::Valid, WorkingBlockState::Invalid)
                    .await?;
                self.release_checkpoint(&record);
                info!("ftw: rolled back an incomplete transaction");
                Ok(RecoveryOutcome::RolledBack)
            }
            TxnPhase::SpareComplete => {
                let sum = self.span_crc(record.spare, record.span_len).await?;
                if sum != record.payload_crc {
                    error!("ftw: spare region does not match its checksum");
                    return Err(Error::Corrupt("spare region does not match its checksum"));
                }
                info!(
                    "ftw: replaying transaction onto {:#x}+{:#x}",
                    record.target, record.span_len
                );
                self.apply(&mut record).await?;
                Ok(RecoveryOutcome::Replayed)
            }
            TxnPhase::DestinationComplete => {
                self.program_flags(WorkingBlockState::Valid, WorkingBlockState::Invalid)
                    .await?;
                self.release_checkpoint(&record);
                debug!("ftw: cleared a completed transaction");
                Ok(RecoveryOutcome::Cleared)
            }
        }
    }

    /// Finish or roll back the transaction the relay holds when the working
    /// block signature is unreadable.
    ///
    /// Nothing is programmed into the damaged block; the relay copy alone
    /// tracks progress, and the next [`begin`](Self::begin) rewrites the
    /// block from scratch.
    async fn recover_from_relay(
        &mut self,
        image: &[u8; WORKING_BLOCK_LEN],
    ) -> Result<RecoveryOutcome, Error<F::Error>> {
        let mut record = match self.relay_record(image) {
            Some(record) if record.phase != TxnPhase::DestinationComplete => record,
            _ => {
                warn!("ftw: working block signature not recognised and nothing in flight, treating as idle");
                return Ok(RecoveryOutcome::Idle);
            }
        };
        warn!("ftw: working block signature not recognised, using the relay copy");

        if record.phase == TxnPhase::Allocated {
            record.phase = TxnPhase::DestinationComplete;
            self.release_checkpoint(&record);
            info!("ftw: rolled back an incomplete transaction");
            return Ok(RecoveryOutcome::RolledBack);
        }

        let sum = self.span_crc(record.spare, record.span_len).await?;
        if sum != record.payload_crc {
            error!("ftw: spare region does not match its checksum");
            return Err(Error::Corrupt("spare region does not match its checksum"));
        }
        info!(
            "ftw: replaying transaction onto {:#x}+{:#x}",
            record.target, record.span_len
        );
        self.replay(&record).await?;
        record.phase = TxnPhase::DestinationComplete;
        self.release_checkpoint(&record);
        Ok(RecoveryOutcome::Replayed)
    }

    /// Erase the target span, copy the spare over it and clear the record.
    async fn apply(&mut self, record: &mut TransactionRecord) -> Result<(), Error<F::Error>> {
        self.replay(record).await?;
        self.program_phase(record, TxnPhase::DestinationComplete)
            .await?;
        self.program_flags(WorkingBlockState::Valid, WorkingBlockState::Invalid)
            .await?;
        self.release_checkpoint(record);
        Ok(())
    }

    async fn replay(&mut self, record: &TransactionRecord) -> Result<(), Error<F::Error>> {
        self.flash
            .erase(record.target, record.span_len)
            .await
            .map_err(Error::Device)?;
        self.copy(record.spare, record.target, record.span_len)
            .await
    }

    async fn abandon(&mut self) {
        self.open = None;
        if self
            .program_flags(WorkingBlockState::Valid, WorkingBlockState::Invalid)
            .await
            .is_err()
        {
            warn!("ftw: could not clear abandoned record, recovery will roll it back");
        }
    }

    fn open_for(&self, handle: &TransactionHandle) -> Result<OpenTransaction, Error<F::Error>> {
        self.open
            .filter(|open| open.id == handle.id)
            .ok_or(Error::InvalidParameter("transaction is not open"))
    }

    async fn program_flags(
        &mut self,
        from: WorkingBlockState,
        to: WorkingBlockState,
    ) -> Result<(), Error<F::Error>> {
        let next = from.downgrade(to)?;
        self.flash
            .write(self.working_span.offset() + FLAGS_OFFSET, &[next.to_byte()])
            .await
            .map_err(Error::Device)
    }

    async fn program_phase(
        &mut self,
        record: &mut TransactionRecord,
        to: TxnPhase,
    ) -> Result<(), Error<F::Error>> {
        let next = record.phase.downgrade(to)?;
        self.flash
            .write(self.working_span.offset() + PHASE_OFFSET, &[next.to_byte()])
            .await
            .map_err(Error::Device)?;
        record.phase = next;
        Ok(())
    }

    async fn copy(&mut self, from: u32, to: u32, len: u32) -> Result<(), Error<F::Error>> {
        let mut chunk = [0u8; COPY_CHUNK];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(COPY_CHUNK as u32);
            let buf = &mut chunk[..n as usize];
            self.flash
                .read(from + done, buf)
                .await
                .map_err(Error::Device)?;
            if buf.iter().any(|b| *b != ERASED_BYTE) {
                self.flash
                    .write(to + done, buf)
                    .await
                    .map_err(Error::Device)?;
            }
            done += n;
        }
        Ok(())
    }

    async fn span_crc(&mut self, offset: u32, len: u32) -> Result<u32, Error<F::Error>> {
        let mut chunk = [0u8; COPY_CHUNK];
        let mut digest = self.crc.digest();
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(COPY_CHUNK as u32);
            let buf = &mut chunk[..n as usize];
            self.flash
                .read(offset + done, buf)
                .await
                .map_err(Error::Device)?;
            digest.update(buf);
            done += n;
        }
        Ok(digest.finalize())
    }

    /// Hand the record image to the relay. The working block stays the
    /// authoritative copy, so relay failures are logged and tolerated.
    fn checkpoint(&mut self, image: &[u8; WORKING_BLOCK_LEN], policy: RestorePolicy) {
        let address = self.config.record_address;
        let len = WORKING_BLOCK_LEN as u64;
        let result = self.relay.stage(address, image).and_then(|()| {
            match self.relay.save(FTW_RECORD_TAG, address, len) {
                Err(crate::relay::RelayError::AlreadyExists) => {
                    self.relay.update(FTW_RECORD_TAG, 0, address, len)
                }
                other => other,
            }
        });
        let result = result.and_then(|()| self.relay.set_restore_policy(FTW_RECORD_TAG, policy));
        if let Err(_e) = result {
            warn!("ftw: relay checkpoint unavailable");
        }
    }

    fn release_checkpoint(&mut self, record: &TransactionRecord) {
        let image = layout::encode(record, &self.crc);
        self.checkpoint(&image, RestorePolicy::None);
    }

    /// The relay's copy of the record, cross-checked against the working
    /// block bytes that `image` still holds.
    ///
    /// The copy is rejected when it names a span this engine could not have
    /// written, or when it disagrees with the fields the header CRC leaves
    /// out: the payload CRC must match, and the phase on flash must not be
    /// behind the relay's, since flash is always programmed first.
    fn relay_record(&mut self, image: &[u8; WORKING_BLOCK_LEN]) -> Option<TransactionRecord> {
        let saved = self.relay.restore(FTW_RECORD_TAG).ok()?;
        let saved: [u8; WORKING_BLOCK_LEN] = saved.as_slice().try_into().ok()?;
        let record = match layout::decode(&saved, &self.crc) {
            WorkingBlockRead::Recorded {
                record: Ok(record), ..
            } => record,
            _ => return None,
        };

        if !self.is_own_span(&record) {
            warn!("ftw: relay copy names a span outside this engine's regions");
            return None;
        }
        let phase_on_flash = TxnPhase::from_byte(image[PHASE_OFFSET as usize]);
        let behind = phase_on_flash.is_some_and(|phase| record.phase.downgrade(phase).is_err());
        if behind || layout::payload_crc(image) != record.payload_crc {
            warn!("ftw: relay copy disagrees with the working block");
            return None;
        }
        Some(record)
    }

    fn is_own_span(&self, record: &TransactionRecord) -> bool {
        let spare = self.config.spare_region;
        record.spare == spare.offset()
            && record.span_len <= spare.len()
            && FlashRegion::new(record.target, record.span_len).is_ok_and(|span| {
                span.is_aligned_to(self.flash.erase_size())
                    && span.end() <= self.flash.capacity()
                    && !span.overlaps(&spare)
                    && !span.overlaps(&self.working_span)
            })
    }
}
