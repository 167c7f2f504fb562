//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use flashvar::relay::{RelayClient, RelayService, SharedMemory};
use flashvar::{FtwConfig, FtwEngine, Guid, RelayConfig, StoreConfig, VariableStore};
use flashvar_adapters::{FlashRegion, RamFlash};

pub type Relay = RelayClient<RelayService<SharedMemory>, SharedMemory>;
pub type Store = VariableStore<RamFlash, Relay>;

/// Vendor namespace used throughout the tests.
pub const VENDOR: Guid = Guid::from_fields(
    0x8be4_df61,
    0x93ca,
    0x11d2,
    [0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c],
);

pub const CAPACITY: u32 = 0x400;
pub const ERASE: u32 = 16;
/// Store header plus exactly three single-byte variables named with one letter.
pub const STORE_LEN: u32 = 176;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn relay() -> Relay {
    let memory = SharedMemory::new(0, 0x2000);
    RelayClient::new(RelayService::new(memory.clone(), RelayConfig::DEFAULT), memory)
}

pub fn ftw_config() -> FtwConfig {
    FtwConfig::new(
        FlashRegion::new(0x300, 0x40).unwrap(),
        FlashRegion::new(0x100, 0x100).unwrap(),
    )
}

pub fn engine(flash: RamFlash) -> FtwEngine<RamFlash, Relay> {
    FtwEngine::new(flash, relay(), ftw_config()).unwrap()
}

pub fn store_config() -> StoreConfig {
    StoreConfig::new(FlashRegion::new(0, STORE_LEN).unwrap())
}

pub async fn open(flash: RamFlash) -> anyhow::Result<Store> {
    Ok(VariableStore::open(engine(flash), store_config()).await?)
}

pub fn close(store: Store) -> RamFlash {
    store.into_ftw().into_parts().0
}
