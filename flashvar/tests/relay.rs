//! Secure relay through its caller-side API, and alongside the FTW engine.

mod common;

use common::{CAPACITY, ERASE, engine, init_logging, relay};
use flashvar::relay::{PhysicalMemory, RelayClient, RelayService, SecureRelay, SharedMemory};
use flashvar::{Guid, RelayConfig, RelayError, RestorePolicy};
use flashvar_adapters::RamFlash;

const TAG: Guid = Guid::from_fields(0xdead_beef, 0x0001, 0x0002, [1, 2, 3, 4, 5, 6, 7, 8]);
const OTHER: Guid = Guid::from_fields(0xdead_beef, 0x0001, 0x0003, [1, 2, 3, 4, 5, 6, 7, 8]);

fn read(memory: &SharedMemory, address: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    memory.read(address, &mut buf).unwrap();
    buf
}

#[test]
fn test_restore_in_place_writes_back() -> anyhow::Result<()> {
    init_logging();
    let mut relay = relay();
    relay.stage(0x100, b"checkpoint")?;
    relay.save(TAG, 0x100, 10)?;
    relay.stage(0x200, b"scratch")?;
    relay.save(OTHER, 0x200, 7)?;
    relay.set_restore_policy(TAG, RestorePolicy::RestoreInPlace)?;

    relay.memory().fill(0x100, 0x200, 0)?;
    relay.restore_all_in_place()?;

    assert_eq!(read(relay.memory(), 0x100, 10), b"checkpoint");
    assert_eq!(read(relay.memory(), 0x200, 7), [0; 7]);
    Ok(())
}

#[test]
fn test_restore_to_caller_buffer() -> anyhow::Result<()> {
    init_logging();
    let mut relay = relay();
    relay.stage(0x100, &[7; 16])?;
    relay.save(TAG, 0x100, 16)?;

    assert!(matches!(
        relay.restore_to(TAG, 0x400, 8),
        Err(RelayError::InvalidParameter(_))
    ));
    relay.restore_to(TAG, 0x400, 16)?;
    assert_eq!(read(relay.memory(), 0x400, 16), [7; 16]);
    assert!(matches!(
        relay.restore_to(TAG, 0, 0),
        Err(RelayError::InvalidParameter(_))
    ));
    assert_eq!(relay.restore(OTHER), Err(RelayError::NotFound));
    Ok(())
}

#[test]
fn test_only_append_only_buffers_grow() -> anyhow::Result<()> {
    init_logging();
    let mut relay = relay();
    relay.stage(0x100, &[1, 2, 3, 4])?;
    relay.save(TAG, 0x100, 4)?;
    relay.stage(0x200, &[5, 6])?;

    assert!(matches!(
        relay.update(TAG, 3, 0x200, 2),
        Err(RelayError::InvalidParameter(_))
    ));
    relay.update(TAG, 2, 0x200, 2)?;
    assert_eq!(relay.restore(TAG)?, [1, 2, 5, 6]);

    relay.set_restore_policy(TAG, RestorePolicy::AppendOnly)?;
    relay.update(TAG, 4, 0x200, 2)?;
    assert_eq!(relay.restore(TAG)?, [1, 2, 5, 6, 5, 6]);
    Ok(())
}

#[test]
fn test_lock_freezes_buffers_but_not_restores() -> anyhow::Result<()> {
    init_logging();
    let mut relay = relay();
    relay.stage(0x100, &[9; 4])?;
    relay.save(TAG, 0x100, 4)?;
    relay.lock()?;

    assert_eq!(relay.save(OTHER, 0x100, 4), Err(RelayError::AccessDenied));
    assert_eq!(relay.update(TAG, 0, 0x100, 4), Err(RelayError::AccessDenied));
    assert_eq!(
        relay.set_restore_policy(TAG, RestorePolicy::RestoreInPlace),
        Err(RelayError::AccessDenied)
    );
    assert_eq!(relay.restore(TAG)?, [9; 4]);
    assert!(relay.context().is_locked());
    Ok(())
}

#[test]
fn test_capacity_limits() -> anyhow::Result<()> {
    init_logging();
    let memory = SharedMemory::new(0, 0x1000);
    let mut relay = RelayClient::new(
        RelayService::new(memory.clone(), RelayConfig::new(32, 2)),
        memory,
    );
    relay.save(TAG, 0, 24)?;
    assert_eq!(relay.save(OTHER, 0, 16), Err(RelayError::OutOfResources));
    relay.save(OTHER, 0, 8)?;
    let third = Guid::from_fields(3, 0, 0, [0; 8]);
    assert_eq!(relay.save(third, 0, 1), Err(RelayError::OutOfResources));
    assert_eq!(relay.save(TAG, 0, 1), Err(RelayError::AlreadyExists));
    Ok(())
}

#[tokio::test]
async fn test_ftw_survives_locked_relay() -> anyhow::Result<()> {
    init_logging();
    let mut ftw = engine(RamFlash::new(CAPACITY, ERASE));
    ftw.relay_mut().lock()?;

    let handle = ftw.begin(0, 0x10).await?;
    ftw.write(&handle, 0, &[0x42; 0x10]).await?;
    ftw.commit(handle).await?;
    assert_eq!(&ftw.flash().image()[..0x10], &[0x42; 0x10]);
    Ok(())
}
