mod common;

use cafe_core::ipc::{DriverState, IosError, RamPartitionId};
use cafe_core::memory::{ProcessRole, VirtualRegion};
use cafe_core::{CodeCacheConfig, Config, Error, System};
use common::{FakeIos, ReplyMode, TIMEOUT};
use std::sync::{Arc, Mutex};
use std::thread;

fn config(cores: usize) -> Config {
    Config {
        cores,
        ipc_timeout: TIMEOUT,
        code_cache: CodeCacheConfig::small(),
    }
}

fn system(cores: usize, ios: &Arc<FakeIos>) -> System {
    let system = System::new(config(cores), ios.clone()).unwrap();
    for core in system.cores() {
        ios.connect(core.id(), core.interrupt_line().clone());
    }
    system
}

#[test_log::test]
fn core_count_is_validated() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    assert_eq!(System::new(config(0), ios.clone()).unwrap_err(), Error::InvalidArgument);
    assert_eq!(System::new(config(4), ios.clone()).unwrap_err(), Error::InvalidArgument);

    let system = system(3, &ios);
    assert_eq!(system.cores().len(), 3);
    assert_eq!(system.config().cores, 3);
    assert!(system.core(3).is_none());
    for core in system.cores() {
        assert_eq!(core.kernel().state(), DriverState::Open);
        assert_eq!(core.loader().state(), DriverState::Open);
        assert_eq!(core.kernel().core(), core.id());
    }
    assert_eq!(system.memory().role(), ProcessRole::ForegroundApp);
}

#[test_log::test]
fn every_core_talks_to_the_kernel_on_its_own() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut system = system(3, &ios);
    let (code_cache, memory, cores) = system.split_mut();

    memory.initialise_app_memory(0x2_0000, 0, 0).unwrap();

    thread::scope(|s| {
        for core in cores.iter_mut() {
            s.spawn(move || {
                let driver = core.kernel_mut();
                let handle = driver.open(RamPartitionId::MainApplication, "/dev/fsa", 0).unwrap();
                assert!(handle > 0);
                driver.close(RamPartitionId::MainApplication, handle).unwrap();

                let address = 0x0200_0000 + core.id() as u32 * 4;
                if let cafe_core::jit::Claim::Won = code_cache.try_claim(address) {
                    let index = code_cache.register_code_block(address, &[0xC3], &[]).unwrap();
                    code_cache.set_block_index(address, index);
                }
            });
        }
    });

    assert!(memory.is_mapped(VirtualRegion::AppCode));
    assert_eq!(system.code_cache().statistics().blocks, 3);
}

#[test_log::test]
fn core_interrupts_drive_the_loader() {
    let ios = FakeIos::new(ReplyMode::Immediate);
    let mut system = system(2, &ios);
    let replies = Arc::new(Mutex::new(Vec::new()));

    let core = system.core_mut(1).unwrap();
    let (kernel, loader) = core.drivers_mut();
    let sink = replies.clone();
    loader
        .open_async(
            kernel,
            "/dev/usb",
            0,
            Some(Box::new(move |reply: IosError| sink.lock().unwrap().push(reply))),
        )
        .unwrap();

    assert_eq!(core.interrupt_line().pending(), 1);
    assert_eq!(core.handle_interrupts().unwrap(), 1);
    assert_eq!(replies.lock().unwrap().len(), 1);
    assert!(replies.lock().unwrap()[0].is_ok());

    // nothing pending is a no-op
    assert_eq!(core.handle_interrupts().unwrap(), 0);
    // the other core never saw any of it
    assert_eq!(system.core(0).unwrap().interrupt_line().pending(), 0);
}

#[test_log::test]
fn loader_replies_drained_by_a_sync_call_still_complete() {
    let ios = FakeIos::new(ReplyMode::Manual);
    let mut system = system(2, &ios);
    let replies = Arc::new(Mutex::new(Vec::new()));

    let core = system.core_mut(0).unwrap();
    let (kernel, loader) = core.drivers_mut();
    let sink = replies.clone();
    loader
        .open_async(
            kernel,
            "/dev/usb",
            0,
            Some(Box::new(move |reply: IosError| sink.lock().unwrap().push(reply))),
        )
        .unwrap();
    let submission = ios.take_submission().unwrap();
    ios.reply(&submission, IosError(1));

    // the sync call waits on the same interrupt line and drains the loader
    // reply along with its own
    ios.set_mode(ReplyMode::Immediate);
    let handle = core
        .kernel_mut()
        .open(RamPartitionId::MainApplication, "/dev/fsa", 0)
        .unwrap();
    assert!(handle > 0);
    assert_eq!(core.interrupt_line().pending(), 0);
    assert_eq!(core.kernel().loader_reply_fifo(RamPartitionId::Loader).len(), 1);
    assert!(replies.lock().unwrap().is_empty());

    assert_eq!(core.handle_interrupts().unwrap(), 0);
    assert_eq!(*replies.lock().unwrap(), vec![IosError(1)]);
    assert!(core.kernel().loader_reply_fifo(RamPartitionId::Loader).is_empty());
}
