//! The variable store: an append-mostly record log with an in-memory index.

use alloc::borrow::Cow;
use alloc::collections::btree_map;
use alloc::vec::Vec;

use embedded_io_async::Write;
use flashvar_adapters::{ERASED_BYTE, FlashDevice};

use crate::config::StoreConfig;
use crate::error::Error;
use crate::ftw::{FtwEngine, RecoveryOutcome};
use crate::guid::Guid;
use crate::marker::{FlashMarker, RecordState, StoreHealth};
use crate::relay::SecureRelay;
use crate::variable::attributes::Attributes;
use crate::variable::header::{self, HEALTH_OFFSET, HeaderStatus, STORE_HEADER_LEN};
use crate::variable::index::{IndexEntry, VariableIndex, VariableKey};
use crate::variable::lock::VariableLocks;
use crate::variable::record::{RECORD_HEADER_LEN, RecordCodec, STATE_OFFSET, is_erased_slot};

const SCAN_CHUNK: usize = 256;

/// A variable's value and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Stored attributes.
    pub attributes: Attributes,
    /// Value bytes.
    pub data: Vec<u8>,
}

/// Space accounting, as reported by [`VariableStore::query_info`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    /// Bytes available for records in an empty store.
    pub maximum_storage_size: u32,
    /// Bytes that can be appended without a reclaim.
    pub remaining_storage_size: u32,
    /// Bytes a reclaim would give back.
    pub reclaimable_size: u32,
    /// Largest value a single variable may hold.
    pub maximum_variable_size: u32,
}

/// Diagnostics counters.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reclaims performed since open.
    pub reclaims: u32,
    /// Damaged records skipped while scanning.
    pub skipped_records: u32,
    /// Live variables.
    pub live_variables: u32,
    /// Bytes taken by live records.
    pub live_bytes: u32,
}

/// Lazy iterator over live keys in store order.
///
/// Borrows the store, so it cannot outlive a write. Call
/// [`VariableStore::enumerate`] again to restart.
pub struct Variables<'a> {
    keys: btree_map::Values<'a, u32, VariableKey>,
}

impl<'a> Iterator for Variables<'a> {
    type Item = &'a VariableKey;

    fn next(&mut self) -> Option<Self::Item> {
        self.keys.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.keys.size_hint()
    }
}

impl ExactSizeIterator for Variables<'_> {}

/// Crash-safe key/value store on raw flash.
///
/// Every new value is appended as a fresh record; the record it supersedes is
/// downgraded in place by clearing bits. When the log is full the live
/// records are compacted into a new image that replaces the region through a
/// single FTW transaction.
///
/// # Examples
///
/// ```ignore
/// let ftw = FtwEngine::new(flash, relay, FtwConfig::new(working, spare))?;
/// let mut store = VariableStore::open(ftw, StoreConfig::new(region)).await?;
///
/// store.put(VENDOR, "BootOrder", &[0, 1], Attributes::NV_BS_RT).await?;
/// let boot_order = store.get(VENDOR, "BootOrder").await?;
/// ```
pub struct VariableStore<F, R> {
    ftw: FtwEngine<F, R>,
    config: StoreConfig,
    codec: RecordCodec,
    index: VariableIndex,
    locks: VariableLocks,
    tail: u32,
    health: StoreHealth,
    needs_reclaim: bool,
    // Set when a region rewrite failed and flash no longer matches the index.
    stale: bool,
    stats: StoreStats,
}

impl<F: FlashDevice, R: SecureRelay> VariableStore<F, R> {
    /// Open the store in `config.region`.
    ///
    /// Runs FTW recovery first, so a region left half-written by an
    /// interrupted reclaim is repaired before it is judged. An unformatted
    /// region is then formatted; a formatted one is scanned into the index.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` if the region is misaligned, leaves the device,
    ///   or is larger than the FTW spare region
    /// - `Corrupt` if recovery cannot proceed
    /// - `Device` on flash failure
    pub async fn open(mut ftw: FtwEngine<F, R>, config: StoreConfig) -> Result<Self, Error<F::Error>> {
        let region = config.region;
        if !region.is_aligned_to(ftw.flash().erase_size()) {
            return Err(Error::InvalidParameter("store region must be erase-aligned"));
        }
        if region.end() > ftw.flash().capacity() {
            return Err(Error::InvalidParameter("store region outside device"));
        }
        if region.len() <= STORE_HEADER_LEN + RECORD_HEADER_LEN as u32 {
            return Err(Error::InvalidParameter("store region too small"));
        }
        if region.overlaps(&ftw.config().spare_region) || region.overlaps(&ftw.config().working_region) {
            return Err(Error::InvalidParameter("store region overlaps FTW regions"));
        }
        if region.len() > ftw.max_transaction_len() {
            return Err(Error::InvalidParameter("store region larger than spare region"));
        }

        let outcome = ftw.recover().await?;
        if outcome != RecoveryOutcome::Idle {
            info!("store: flash recovered before open");
        }

        let codec = RecordCodec::new(ftw.config().crc, config.limits);
        let mut store = Self {
            ftw,
            config,
            codec,
            index: VariableIndex::new(),
            locks: VariableLocks::new(),
            tail: STORE_HEADER_LEN,
            health: StoreHealth::Healthy,
            needs_reclaim: false,
            stale: false,
            stats: StoreStats::default(),
        };
        store.load().await?;
        debug!(
            "store: open, {} variables, tail at {:#x}",
            store.index.len(),
            store.tail
        );
        Ok(store)
    }

    /// The FTW engine, e.g. to reach the flash device.
    pub fn ftw(&self) -> &FtwEngine<F, R> {
        &self.ftw
    }

    /// Mutable access to the FTW engine, e.g. to power-cycle a simulated part.
    ///
    /// Writing to the store region behind the store's back leaves its index
    /// out of date.
    pub fn ftw_mut(&mut self) -> &mut FtwEngine<F, R> {
        &mut self.ftw
    }

    /// Close the store and hand back the FTW engine.
    pub fn into_ftw(self) -> FtwEngine<F, R> {
        self.ftw
    }

    /// The configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether the log scanned cleanly.
    pub fn is_healthy(&self) -> bool {
        self.health == StoreHealth::Healthy
    }

    /// Read a variable.
    ///
    /// # Errors
    ///
    /// `NotFound` if no live record exists for the key.
    pub async fn get(&mut self, namespace: Guid, name: &str) -> Result<Variable, Error<F::Error>> {
        self.resync().await?;
        let key = VariableKey::new(namespace, name);
        let entry = *self.index.get(&key).ok_or(Error::NotFound)?;
        let data = self.read_value(&entry).await?;
        Ok(Variable {
            attributes: entry.attributes,
            data,
        })
    }

    /// Create or replace a variable.
    ///
    /// With [`Attributes::APPEND_WRITE`] the data is appended to the current
    /// value. Writing the current value again does not touch flash.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` for an empty or oversized name, an oversized
    ///   value, invalid attributes, or attributes that differ from the
    ///   existing variable's
    /// - `WriteProtected` if the key is locked
    /// - `OutOfResources` if the store cannot hold the record even after a
    ///   reclaim; the store is left unchanged
    pub async fn put(
        &mut self,
        namespace: Guid,
        name: &str,
        data: &[u8],
        attributes: Attributes,
    ) -> Result<(), Error<F::Error>> {
        attributes.validate().map_err(Error::InvalidParameter)?;
        self.codec
            .encoded_len(name.len(), data.len())
            .map_err(|e| Error::InvalidParameter(e.as_str()))?;
        let key = VariableKey::new(namespace, name);
        if self.locks.is_write_protected(&key) {
            return Err(Error::WriteProtected);
        }
        self.resync().await?;

        let stored = attributes.persistent();
        let append = attributes.contains(Attributes::APPEND_WRITE);
        let existing = self.index.get(&key).copied();

        let value: Cow<'_, [u8]> = match existing {
            Some(entry) => {
                if entry.attributes != stored {
                    return Err(Error::InvalidParameter(
                        "attributes differ from the existing variable",
                    ));
                }
                if append {
                    if data.is_empty() {
                        return Ok(());
                    }
                    let mut value = self.read_value(&entry).await?;
                    value.extend_from_slice(data);
                    Cow::Owned(value)
                } else {
                    if entry.value_len as usize == data.len()
                        && entry.state == RecordState::Added
                        && self.read_value(&entry).await? == data
                    {
                        trace!("store: unchanged write elided");
                        return Ok(());
                    }
                    Cow::Borrowed(data)
                }
            }
            None => Cow::Borrowed(data),
        };

        let record = self
            .codec
            .encode(RecordState::HeaderValidOnly, namespace, name, &value, stored)
            .map_err(|e| Error::InvalidParameter(e.as_str()))?;
        let size = record.len() as u32;

        if !self.has_room(size) {
            let needed = STORE_HEADER_LEN
                .checked_add(self.index.live_bytes())
                .and_then(|n| n.checked_add(size));
            match needed {
                Some(needed) if needed <= self.config.region.len() => {}
                _ => return Err(Error::OutOfResources("variable store full")),
            }
            self.reclaim().await?;
            if !self.has_room(size) {
                return Err(Error::OutOfResources("variable store full"));
            }
        }

        // Offsets may have moved during a reclaim.
        let existing = self.index.get(&key).copied();
        self.append(key, existing, &record).await
    }

    /// Delete a variable.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the key has no live record
    /// - `WriteProtected` if the key is locked
    pub async fn delete(&mut self, namespace: Guid, name: &str) -> Result<(), Error<F::Error>> {
        let key = VariableKey::new(namespace, name);
        if self.locks.is_write_protected(&key) {
            return Err(Error::WriteProtected);
        }
        self.resync().await?;
        let entry = *self.index.get(&key).ok_or(Error::NotFound)?;

        // Older transition records first, so none can resurface as live.
        for shadow in self.index.shadows(&key).to_vec() {
            self.program_state(shadow, RecordState::InDeletedTransition, RecordState::Deleted)
                .await?;
        }
        self.program_state(entry.offset, entry.state, RecordState::Deleted)
            .await?;
        self.index.remove(&key);
        debug!("store: deleted record at {:#x}", entry.offset);
        Ok(())
    }

    /// Live keys in store order.
    ///
    /// Reading a value needs the store mutably, so the iterator cannot be
    /// held across [`get`](Self::get). Collect the keys first, or use
    /// [`variables`](Self::variables) to read keys and values together.
    pub fn enumerate(&self) -> Variables<'_> {
        Variables {
            keys: self.index.keys(),
        }
    }

    /// Every live variable with its value, in store order.
    pub async fn variables(&mut self) -> Result<Vec<(VariableKey, Variable)>, Error<F::Error>> {
        self.resync().await?;
        let live: Vec<(VariableKey, IndexEntry)> = self
            .index
            .iter()
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();
        let mut variables = Vec::with_capacity(live.len());
        for (key, entry) in live {
            let data = self.read_value(&entry).await?;
            variables.push((
                key,
                Variable {
                    attributes: entry.attributes,
                    data,
                },
            ));
        }
        Ok(variables)
    }

    /// Cursor-style enumeration: the key after `previous`, or the first key.
    ///
    /// Returns `Ok(None)` past the last key.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `previous` is not a live key.
    pub fn next_variable_name(
        &self,
        previous: Option<(Guid, &str)>,
    ) -> Result<Option<&VariableKey>, Error<F::Error>> {
        let previous = previous.map(|(namespace, name)| VariableKey::new(namespace, name));
        self.index
            .next_after(previous.as_ref())
            .ok_or(Error::InvalidParameter("previous variable not found"))
    }

    /// Make `name` read-only once [`signal_end_of_boot`](Self::signal_end_of_boot)
    /// is called.
    ///
    /// # Errors
    ///
    /// `AccessDenied` after end of boot.
    pub fn request_lock(&mut self, namespace: Guid, name: &str) -> Result<(), Error<F::Error>> {
        self.locks
            .request(VariableKey::new(namespace, name))
            .map_err(|_| Error::AccessDenied)
    }

    /// Enforce the requested locks.
    pub fn signal_end_of_boot(&mut self) {
        info!("store: end of boot, variable locks enforced");
        self.locks.signal_end_of_boot();
    }

    /// Whether end of boot has been signalled.
    pub fn is_end_of_boot(&self) -> bool {
        self.locks.is_end_of_boot()
    }

    /// Space accounting.
    pub fn query_info(&self) -> StoreInfo {
        let region_len = self.config.region.len();
        let maximum = region_len - STORE_HEADER_LEN;
        let used = self.tail - STORE_HEADER_LEN;
        let remaining = if self.needs_reclaim {
            0
        } else {
            region_len - self.tail
        };
        StoreInfo {
            maximum_storage_size: maximum,
            remaining_storage_size: remaining,
            reclaimable_size: used.saturating_sub(self.index.live_bytes()),
            maximum_variable_size: self.codec.limits().max_value_len,
        }
    }

    /// Diagnostics counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live_variables: self.index.len() as u32,
            live_bytes: self.index.live_bytes(),
            ..self.stats
        }
    }

    /// Compact the log down to its live records.
    ///
    /// The compacted image replaces the whole region through one FTW
    /// transaction, with the spare region as the secondary copy. Records
    /// left `in-deleted-transition` by an interrupted update come back
    /// `added`.
    pub async fn reclaim(&mut self) -> Result<(), Error<F::Error>> {
        self.resync().await?;
        let live: Vec<(VariableKey, IndexEntry)> = self
            .index
            .iter()
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();

        let mut body = Vec::with_capacity(self.index.live_bytes() as usize);
        let mut index = VariableIndex::new();
        for (key, entry) in live {
            let mut record = alloc::vec![0u8; entry.size as usize];
            self.read(entry.offset, &mut record).await?;
            if self.codec.decode(&record).is_err() {
                error!("store: record at {:#x} changed since open", entry.offset);
                return Err(Error::Corrupt("live record failed its CRC during reclaim"));
            }
            record[STATE_OFFSET as usize] = RecordState::Added.to_byte();

            let offset = STORE_HEADER_LEN + body.len() as u32;
            body.extend_from_slice(&record);
            index.observe(
                key,
                IndexEntry {
                    offset,
                    state: RecordState::Added,
                    ..entry
                },
            );
        }

        self.rewrite(body, index).await?;
        self.stats.reclaims += 1;
        info!(
            "store: reclaimed, {} variables in {} bytes",
            self.index.len(),
            self.tail
        );
        Ok(())
    }

    /// Read the header, then format the region or scan it into the index.
    async fn load(&mut self) -> Result<(), Error<F::Error>> {
        let region = self.config.region;
        self.index = VariableIndex::new();
        self.tail = STORE_HEADER_LEN;
        self.health = StoreHealth::Healthy;
        self.needs_reclaim = false;
        self.stats.skipped_records = 0;

        let mut raw = [0u8; STORE_HEADER_LEN as usize];
        self.read(0, &mut raw).await?;
        match header::inspect(&raw, region.len()) {
            HeaderStatus::Unformatted => {
                info!("store: formatting region {:#x}+{:#x}", region.offset(), region.len());
                self.write_region(&[]).await?;
            }
            HeaderStatus::Formatted(health) => {
                self.health = health;
                self.needs_reclaim = health == StoreHealth::Damaged;
                self.scan().await?;
            }
        }
        Ok(())
    }

    /// Rebuild the index from flash if a failed rewrite left it behind.
    ///
    /// Recovery either rolls the rewrite back or finishes it, and only
    /// flash knows which. Until that succeeds the index is empty and every
    /// operation that touches flash retries here first.
    async fn resync(&mut self) -> Result<(), Error<F::Error>> {
        if !self.stale {
            return Ok(());
        }
        let outcome = self.ftw.recover().await?;
        debug!("store: recovery after a failed rewrite: {:?}", outcome);
        self.load().await?;
        self.stale = false;
        info!("store: index rebuilt, {} variables", self.index.len());
        Ok(())
    }

    /// Replace the region with a fresh header followed by `body`, described
    /// by `index`.
    ///
    /// On failure the index can no longer be trusted: flash may hold either
    /// image once recovery has run. The store resynchronises from flash
    /// right away, or on the next operation if the device is still failing.
    async fn rewrite(&mut self, body: Vec<u8>, index: VariableIndex) -> Result<(), Error<F::Error>> {
        let region = self.config.region;
        let end = (STORE_HEADER_LEN as usize)
            .checked_add(body.len())
            .filter(|end| *end <= region.len() as usize)
            .ok_or(Error::OutOfResources("live records exceed the store region"))?;

        if let Err(e) = self.write_region(&body).await {
            warn!("store: region rewrite failed, rebuilding the index from flash");
            self.stale = true;
            self.index = VariableIndex::new();
            self.needs_reclaim = true;
            if self.resync().await.is_err() {
                warn!("store: flash unavailable, index rebuild deferred");
            }
            return Err(e);
        }

        self.index = index;
        self.tail = end as u32;
        self.health = StoreHealth::Healthy;
        self.needs_reclaim = false;
        Ok(())
    }

    async fn write_region(&mut self, body: &[u8]) -> Result<(), Error<F::Error>> {
        let region = self.config.region;
        let handle = self.ftw.begin(region.offset(), region.len()).await?;
        let mut writer = self.ftw.writer(handle);
        writer.write_all(&header::encode(region.len())).await?;
        writer.write_all(body).await?;
        writer.commit().await
    }

    async fn append(
        &mut self,
        key: VariableKey,
        existing: Option<IndexEntry>,
        record: &[u8],
    ) -> Result<(), Error<F::Error>> {
        for shadow in self.index.shadows(&key).to_vec() {
            self.program_state(shadow, RecordState::InDeletedTransition, RecordState::Deleted)
                .await?;
        }
        if let Some(entry) = existing {
            if entry.state == RecordState::Added {
                self.program_state(entry.offset, RecordState::Added, RecordState::InDeletedTransition)
                    .await?;
                self.index.set_state(&key, RecordState::InDeletedTransition);
            }
        }

        let offset = self.tail;
        let header = self
            .codec
            .decode_header(record)
            .map_err(|e| Error::InvalidParameter(e.as_str()))?;
        let address = self.config.region.offset() + offset;
        if let Err(e) = self.ftw.flash_mut().write(address, record).await {
            warn!("store: append at {:#x} failed, reclaim scheduled", offset);
            self.needs_reclaim = true;
            return Err(Error::Device(e));
        }
        self.tail += header.size;
        if let Err(e) = self
            .program_state(offset, RecordState::HeaderValidOnly, RecordState::Added)
            .await
        {
            self.needs_reclaim = true;
            return Err(e);
        }

        trace!("store: appended {} bytes at {:#x}", header.size, offset);
        self.index.replace(
            key,
            IndexEntry {
                offset,
                state: RecordState::Added,
                attributes: header.attributes,
                value_offset: header.value_offset(),
                value_len: header.value_len,
                size: header.size,
            },
        );
        Ok(())
    }

    async fn scan(&mut self) -> Result<(), Error<F::Error>> {
        let region_len = self.config.region.len();
        let mut offset = STORE_HEADER_LEN;
        let mut raw = [0u8; RECORD_HEADER_LEN];

        while offset + RECORD_HEADER_LEN as u32 <= region_len {
            self.read(offset, &mut raw).await?;
            if is_erased_slot(&raw) {
                break;
            }
            let header = match self.codec.decode_header(&raw) {
                Ok(header) if offset.checked_add(header.size).is_some_and(|end| end <= region_len) => header,
                _ => {
                    warn!("store: unreadable record header at {:#x}, log ends here", offset);
                    self.mark_damaged().await?;
                    break;
                }
            };

            match header.state() {
                Some(state) if state.is_live() => {
                    let mut record = alloc::vec![0u8; header.size as usize];
                    self.read(offset, &mut record).await?;
                    match self.codec.decode(&record) {
                        Ok(decoded) => self.index.observe(
                            VariableKey::new(decoded.header.namespace, decoded.name),
                            IndexEntry {
                                offset,
                                state,
                                attributes: header.attributes,
                                value_offset: header.value_offset(),
                                value_len: header.value_len,
                                size: header.size,
                            },
                        ),
                        Err(_) => {
                            warn!("store: skipping damaged record at {:#x}", offset);
                            self.stats.skipped_records += 1;
                        }
                    }
                }
                Some(RecordState::Deleted) => {}
                Some(_) => trace!("store: skipping incomplete record at {:#x}", offset),
                None => {
                    warn!("store: skipping record with unknown state at {:#x}", offset);
                    self.stats.skipped_records += 1;
                }
            }
            offset += header.size;
        }
        self.tail = offset;

        if !self.free_space_is_erased().await? {
            warn!("store: free space at {:#x} is not erased, reclaim scheduled", offset);
            self.needs_reclaim = true;
        }
        Ok(())
    }

    async fn free_space_is_erased(&mut self) -> Result<bool, Error<F::Error>> {
        let region_len = self.config.region.len();
        let mut chunk = [0u8; SCAN_CHUNK];
        let mut offset = self.tail;
        while offset < region_len {
            let n = (region_len - offset).min(SCAN_CHUNK as u32) as usize;
            self.read(offset, &mut chunk[..n]).await?;
            if chunk[..n].iter().any(|b| *b != ERASED_BYTE) {
                return Ok(false);
            }
            offset += n as u32;
        }
        Ok(true)
    }

    async fn mark_damaged(&mut self) -> Result<(), Error<F::Error>> {
        self.needs_reclaim = true;
        if self.health == StoreHealth::Damaged {
            return Ok(());
        }
        let next = self.health.downgrade(StoreHealth::Damaged)?;
        let address = self.config.region.offset() + HEALTH_OFFSET;
        self.ftw
            .flash_mut()
            .write(address, &[next.to_byte()])
            .await
            .map_err(Error::Device)?;
        self.health = next;
        Ok(())
    }

    fn has_room(&self, size: u32) -> bool {
        !self.needs_reclaim
            && self
                .tail
                .checked_add(size)
                .is_some_and(|end| end <= self.config.region.len())
    }

    async fn program_state(
        &mut self,
        offset: u32,
        from: RecordState,
        to: RecordState,
    ) -> Result<(), Error<F::Error>> {
        let next = from.downgrade(to)?;
        let address = self.config.region.offset() + offset + STATE_OFFSET;
        self.ftw
            .flash_mut()
            .write(address, &[next.to_byte()])
            .await
            .map_err(Error::Device)
    }

    async fn read_value(&mut self, entry: &IndexEntry) -> Result<Vec<u8>, Error<F::Error>> {
        let mut data = alloc::vec![0u8; entry.value_len as usize];
        self.read(entry.offset + entry.value_offset, &mut data).await?;
        Ok(data)
    }

    async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error<F::Error>> {
        let address = self.config.region.offset() + offset;
        self.ftw
            .flash_mut()
            .read(address, buf)
            .await
            .map_err(Error::Device)
    }
}
