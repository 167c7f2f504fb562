//! Trusted side of the relay.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config::RelayConfig;
use crate::guid::Guid;
use crate::relay::protocol::{
    IsolatedContext, PARAM_BLOCK_LEN, ParamBlock, RelayCommand, RelayResponse, RestorePolicy,
};
use crate::relay::{PhysicalMemory, RelayError};

#[derive(Debug, Clone)]
struct SavedBuffer {
    address: u64,
    policy: RestorePolicy,
    data: Vec<u8>,
}

/// The isolated context's buffer custody.
///
/// Buffers are copied out of shared memory into storage the caller cannot
/// reach; only [`IsolatedContext::call`] gets at them.
#[derive(Debug)]
pub struct RelayService<M> {
    memory: M,
    config: RelayConfig,
    buffers: BTreeMap<Guid, SavedBuffer>,
    used: usize,
    locked: bool,
}

impl<M: PhysicalMemory> RelayService<M> {
    /// Empty custody over `memory`.
    pub fn new(memory: M, config: RelayConfig) -> Self {
        Self {
            memory,
            config,
            buffers: BTreeMap::new(),
            used: 0,
            locked: false,
        }
    }

    /// Bytes held across all buffers.
    pub fn bytes_used(&self) -> usize {
        self.used
    }

    /// Number of saved buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether nothing is saved.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether [`RelayCommand::Lock`] has been received.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn save(&mut self, params: &ParamBlock) -> Result<(), RelayError> {
        self.ensure_unlocked()?;
        if self.buffers.contains_key(&params.tag) {
            return Err(RelayError::AlreadyExists);
        }
        let len = to_len(params.length)?;
        if len == 0 {
            return Err(RelayError::InvalidParameter("empty buffer"));
        }
        if self.buffers.len() >= self.config.max_entries {
            return Err(RelayError::OutOfResources);
        }
        self.reserve(len)?;

        let mut data = alloc::vec![0u8; len];
        self.memory.read(params.address, &mut data)?;
        self.used += len;
        self.buffers.insert(
            params.tag,
            SavedBuffer {
                address: params.address,
                policy: RestorePolicy::None,
                data,
            },
        );
        debug!("relay: saved {} bytes", len);
        Ok(())
    }

    fn update(&mut self, params: &ParamBlock) -> Result<(), RelayError> {
        self.ensure_unlocked()?;
        let len = to_len(params.length)?;
        let offset = to_len(params.offset)?;
        let end = offset
            .checked_add(len)
            .ok_or(RelayError::InvalidParameter("update range overflows"))?;

        let buffer = self.buffers.get(&params.tag).ok_or(RelayError::NotFound)?;
        let growth = end.saturating_sub(buffer.data.len());
        if growth > 0 {
            if buffer.policy != RestorePolicy::AppendOnly {
                return Err(RelayError::InvalidParameter("update past end of saved buffer"));
            }
            self.reserve(growth)?;
        }

        let mut patch = alloc::vec![0u8; len];
        self.memory.read(params.address, &mut patch)?;

        let buffer = self.buffers.get_mut(&params.tag).ok_or(RelayError::NotFound)?;
        if growth > 0 {
            buffer.data.resize(end, 0);
        }
        buffer.data[offset..end].copy_from_slice(&patch);
        self.used += growth;
        Ok(())
    }

    fn set_attributes(&mut self, params: &ParamBlock) -> Result<(), RelayError> {
        self.ensure_unlocked()?;
        let buffer = self.buffers.get_mut(&params.tag).ok_or(RelayError::NotFound)?;
        buffer.policy = params.policy;
        Ok(())
    }

    fn restore(&mut self, params: &ParamBlock) -> Result<Vec<u8>, RelayError> {
        let buffer = self.buffers.get(&params.tag).ok_or(RelayError::NotFound)?;
        if params.address == 0 && params.length == 0 {
            return Ok(buffer.data.clone());
        }
        if to_len(params.length)? < buffer.data.len() {
            return Err(RelayError::InvalidParameter("restore buffer too small"));
        }
        self.memory.write(params.address, &buffer.data)?;
        Ok(Vec::new())
    }

    fn restore_all_in_place(&mut self) -> Result<(), RelayError> {
        let mut restored = 0usize;
        for buffer in self.buffers.values() {
            if buffer.policy == RestorePolicy::RestoreInPlace {
                self.memory.write(buffer.address, &buffer.data)?;
                restored += 1;
            }
        }
        debug!("relay: restored {} buffers in place", restored);
        Ok(())
    }

    fn ensure_unlocked(&self) -> Result<(), RelayError> {
        if self.locked {
            warn!("relay: request refused after lock");
            Err(RelayError::AccessDenied)
        } else {
            Ok(())
        }
    }

    fn reserve(&self, extra: usize) -> Result<(), RelayError> {
        match self.used.checked_add(extra) {
            Some(total) if total <= self.config.capacity_bytes => Ok(()),
            _ => Err(RelayError::OutOfResources),
        }
    }

    fn dispatch(&mut self, command: RelayCommand, params: &ParamBlock) -> Result<Vec<u8>, RelayError> {
        match command {
            RelayCommand::Save => self.save(params).map(|()| Vec::new()),
            RelayCommand::Update => self.update(params).map(|()| Vec::new()),
            RelayCommand::Restore => self.restore(params),
            RelayCommand::SetAttributes => self.set_attributes(params).map(|()| Vec::new()),
            RelayCommand::RestoreAllInPlace => self.restore_all_in_place().map(|()| Vec::new()),
            RelayCommand::Lock => {
                self.locked = true;
                info!("relay: locked");
                Ok(Vec::new())
            }
        }
    }
}

fn to_len(value: u64) -> Result<usize, RelayError> {
    usize::try_from(value).map_err(|_| RelayError::InvalidParameter("length does not fit in memory"))
}

impl<M: PhysicalMemory> IsolatedContext for RelayService<M> {
    fn call(&mut self, command: u32, params: &[u8; PARAM_BLOCK_LEN]) -> RelayResponse {
        let Some(command) = RelayCommand::from_code(command) else {
            return RelayResponse::failure(RelayError::InvalidParameter("unknown relay command"));
        };
        let result = ParamBlock::decode(params).and_then(|params| self.dispatch(command, &params));
        match result {
            Ok(data) => RelayResponse::with_data(data),
            Err(err) => RelayResponse::failure(err),
        }
    }
}
