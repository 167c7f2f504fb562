//! Power-loss sweeps.
//!
//! Each test arms a power cut after every possible number of programming
//! steps, reboots the simulated part and checks that what comes back is
//! either the state before the operation or the state after it.

mod common;

use common::{CAPACITY, ERASE, VENDOR, close, engine, init_logging, open};
use flashvar::{Attributes, Error, FtwEngine, RecoveryOutcome};
use flashvar_adapters::{FlashDevice, RamFlash};

const SWEEP_LIMIT: u64 = 10_000;
const TARGET: u32 = 0;
const TARGET_LEN: u32 = 0x40;

async fn transaction(ftw: &mut FtwEngine<RamFlash, common::Relay>) -> anyhow::Result<()> {
    let handle = ftw.begin(TARGET, TARGET_LEN).await?;
    ftw.write(&handle, 0, &[0xA5; 0x20]).await?;
    ftw.write(&handle, 0x20, &[0xA5; 0x20]).await?;
    ftw.commit(handle).await?;
    Ok(())
}

fn target(flash: &RamFlash) -> &[u8] {
    &flash.image()[TARGET as usize..(TARGET + TARGET_LEN) as usize]
}

async fn recovered(flash: RamFlash) -> anyhow::Result<RamFlash> {
    let mut ftw = engine(flash);
    ftw.recover().await?;
    Ok(ftw.into_parts().0)
}

async fn base_flash() -> anyhow::Result<RamFlash> {
    let mut flash = RamFlash::new(CAPACITY, ERASE);
    flash.write(TARGET, &[0x11; TARGET_LEN as usize]).await?;
    Ok(flash)
}

#[tokio::test]
async fn test_transaction_is_all_or_nothing() -> anyhow::Result<()> {
    init_logging();
    let base = base_flash().await?;

    for budget in 0..SWEEP_LIMIT {
        let mut flash = base.clone();
        flash.cut_power_after(budget);
        let mut ftw = engine(flash);
        let result = transaction(&mut ftw).await;
        let mut flash = ftw.into_parts().0;
        if result.is_ok() && flash.is_powered() {
            assert!(target(&flash).iter().all(|b| *b == 0xA5));
            return Ok(());
        }

        flash.power_cycle();
        let flash = recovered(flash).await?;
        let content = target(&flash);
        assert!(
            content.iter().all(|b| *b == 0x11) || content.iter().all(|b| *b == 0xA5),
            "mixed content after a cut at step {budget}"
        );
    }
    panic!("transaction never completed within {SWEEP_LIMIT} steps");
}

#[tokio::test]
async fn test_recovery_is_idempotent() -> anyhow::Result<()> {
    init_logging();
    let base = base_flash().await?;

    for budget in (0..SWEEP_LIMIT).step_by(7) {
        let mut flash = base.clone();
        flash.cut_power_after(budget);
        let mut ftw = engine(flash);
        let result = transaction(&mut ftw).await;
        let mut crashed = ftw.into_parts().0;
        if result.is_ok() && crashed.is_powered() {
            return Ok(());
        }
        crashed.power_cycle();

        let once = recovered(crashed.clone()).await?;
        let twice = recovered(once.clone()).await?;
        assert_eq!(once.image(), twice.image(), "second recovery changed flash, cut at {budget}");

        // Power lost again while recovering.
        for second in 0..40 {
            let mut flash = crashed.clone();
            flash.cut_power_after(second);
            let mut ftw = engine(flash);
            let _ = ftw.recover().await;
            let mut flash = ftw.into_parts().0;
            flash.power_cycle();
            let flash = recovered(flash).await?;
            assert_eq!(target(&flash), target(&once), "cuts at {budget} then {second}");
        }
    }
    panic!("transaction never completed within {SWEEP_LIMIT} steps");
}

#[tokio::test]
async fn test_recovery_outcome_follows_phase() -> anyhow::Result<()> {
    init_logging();
    let mut ftw = engine(base_flash().await?);
    let handle = ftw.begin(TARGET, TARGET_LEN).await?;
    ftw.write(&handle, 0, &[0xA5; 4]).await?;
    drop(handle);

    let mut ftw = engine(ftw.into_parts().0);
    assert_eq!(ftw.recover().await?, RecoveryOutcome::RolledBack);
    assert_eq!(ftw.recover().await?, RecoveryOutcome::Idle);
    assert!(target(ftw.flash()).iter().all(|b| *b == 0x11));
    Ok(())
}

async fn populated() -> anyhow::Result<RamFlash> {
    let mut store = open(RamFlash::new(CAPACITY, ERASE)).await?;
    store.put(VENDOR, "A", &[1], Attributes::NV_BS_RT).await?;
    store.put(VENDOR, "B", &[2], Attributes::NV_BS_RT).await?;
    Ok(close(store))
}

async fn sweep_put(base: RamFlash, name: &str, old: Option<u8>, new: u8) -> anyhow::Result<()> {
    for budget in 0..SWEEP_LIMIT {
        let mut flash = base.clone();
        flash.cut_power_after(budget);
        // A clean open programs nothing, so the budget is spent by the put.
        let mut store = open(flash).await?;
        let result = store.put(VENDOR, name, &[new], Attributes::NV_BS_RT).await;
        let mut flash = close(store);
        if result.is_ok() && flash.is_powered() {
            return Ok(());
        }
        assert!(matches!(result, Err(Error::Device(_))));

        flash.power_cycle();
        let mut store = open(flash).await?;
        let value = match store.get(VENDOR, name).await {
            Ok(var) => Some(var.data[0]),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        assert!(
            value == old || value == Some(new),
            "{name} read {value:?} after a cut at step {budget}"
        );
        assert_eq!(store.get(VENDOR, "B").await?.data, [2]);

        // The store stays writable after the crash.
        store.delete(VENDOR, "B").await?;
        assert!(matches!(store.get(VENDOR, "B").await, Err(Error::NotFound)));
    }
    panic!("put never completed within {SWEEP_LIMIT} steps");
}

#[tokio::test]
async fn test_interrupted_update_keeps_one_value() -> anyhow::Result<()> {
    init_logging();
    sweep_put(populated().await?, "A", Some(1), 3).await
}

#[tokio::test]
async fn test_interrupted_reclaim_keeps_live_set() -> anyhow::Result<()> {
    init_logging();
    let mut store = open(populated().await?).await?;
    store.put(VENDOR, "A", &[3], Attributes::NV_BS_RT).await?;
    let base = close(store);

    // The fourth record only fits after a reclaim.
    sweep_put(base, "C", None, 4).await
}
