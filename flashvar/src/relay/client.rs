//! Caller side of the relay.

use alloc::vec::Vec;

use crate::guid::Guid;
use crate::relay::protocol::{IsolatedContext, ParamBlock, RelayCommand, RestorePolicy};
use crate::relay::{PhysicalMemory, RelayError, SecureRelay};

/// Encodes requests into parameter blocks and enters the isolated context.
///
/// # Examples
///
/// ```
/// use flashvar::relay::{RelayClient, RelayService, SecureRelay, SharedMemory};
/// use flashvar::{Guid, RelayConfig};
///
/// let memory = SharedMemory::new(0, 4096);
/// let service = RelayService::new(memory.clone(), RelayConfig::DEFAULT);
/// let mut relay = RelayClient::new(service, memory);
///
/// let tag = Guid::from_bytes([0x42; 16]);
/// relay.stage(0x100, b"checkpoint").unwrap();
/// relay.save(tag, 0x100, 10).unwrap();
/// assert_eq!(relay.restore(tag).unwrap(), b"checkpoint");
/// ```
#[derive(Debug)]
pub struct RelayClient<C, M> {
    context: C,
    memory: M,
}

impl<C: IsolatedContext, M: PhysicalMemory> RelayClient<C, M> {
    /// Client entering `context`, staging buffers in `memory`.
    pub fn new(context: C, memory: M) -> Self {
        Self { context, memory }
    }

    /// The isolated context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Caller memory.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Split back into context and memory.
    pub fn into_parts(self) -> (C, M) {
        (self.context, self.memory)
    }

    fn call(&mut self, command: RelayCommand, params: ParamBlock) -> Result<Vec<u8>, RelayError> {
        trace!("relay: command {}", command.code());
        self.context
            .call(command.code(), &params.encode())
            .into_result()
    }
}

impl<C: IsolatedContext, M: PhysicalMemory> SecureRelay for RelayClient<C, M> {
    fn save(&mut self, tag: Guid, address: u64, length: u64) -> Result<(), RelayError> {
        let params = ParamBlock {
            address,
            length,
            ..ParamBlock::for_tag(tag)
        };
        self.call(RelayCommand::Save, params).map(drop)
    }

    fn update(
        &mut self,
        tag: Guid,
        offset: u64,
        address: u64,
        length: u64,
    ) -> Result<(), RelayError> {
        let params = ParamBlock {
            address,
            length,
            offset,
            ..ParamBlock::for_tag(tag)
        };
        self.call(RelayCommand::Update, params).map(drop)
    }

    fn set_restore_policy(&mut self, tag: Guid, policy: RestorePolicy) -> Result<(), RelayError> {
        let params = ParamBlock {
            policy,
            ..ParamBlock::for_tag(tag)
        };
        self.call(RelayCommand::SetAttributes, params).map(drop)
    }

    fn restore(&mut self, tag: Guid) -> Result<Vec<u8>, RelayError> {
        self.call(RelayCommand::Restore, ParamBlock::for_tag(tag))
    }

    fn restore_to(&mut self, tag: Guid, address: u64, capacity: u64) -> Result<(), RelayError> {
        if address == 0 && capacity == 0 {
            return Err(RelayError::InvalidParameter("restore target missing"));
        }
        let params = ParamBlock {
            address,
            length: capacity,
            ..ParamBlock::for_tag(tag)
        };
        self.call(RelayCommand::Restore, params).map(drop)
    }

    fn restore_all_in_place(&mut self) -> Result<(), RelayError> {
        self.call(RelayCommand::RestoreAllInPlace, ParamBlock::default())
            .map(drop)
    }

    fn lock(&mut self) -> Result<(), RelayError> {
        self.call(RelayCommand::Lock, ParamBlock::default()).map(drop)
    }

    fn stage(&mut self, address: u64, bytes: &[u8]) -> Result<(), RelayError> {
        self.memory.write(address, bytes)
    }
}
